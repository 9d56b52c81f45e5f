use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if let Some(e) = e.get_ref().and_then(|e| e.downcast_ref::<Error>()).cloned() {
            e
        } else if e.kind() == std::io::ErrorKind::InvalidInput {
            ErrorKind::InvalidInput.cause(e).into()
        } else {
            ErrorKind::Other.cause(e).into()
        }
    }
}
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        if *e.kind() == ErrorKind::InvalidInput {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// アロケータが管理していないポインタ、あるいは解放不能なポインタの解放が要求された.
    ///
    /// 具体的には以下のいずれかの場合に返される:
    ///
    /// - ポインタが管理領域の範囲外
    /// - ポインタがブロック境界に沿っていない
    /// - ポインタがアロケータ自身のメタデータ領域を指している
    /// - 対応する割当記録が存在しない (二重解放を含む)
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InvalidFree,

    /// アロケータに十分な空き領域がない.
    ///
    /// なお`alloc`自体は失敗を`AllocResult`の中で表現するため、
    /// このエラーが返されるのは`create`等の補助関数経由の場合のみ.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者が不要な割当を解放する
    /// - より容量の大きいアロケータを下位に重ねる
    MemoryFull,

    /// 入力が不正.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// `validate`による検査が失敗した場合等にこのエラーが返される.
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,

    /// その他エラー.
    ///
    /// E.g., I/Oエラー
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
