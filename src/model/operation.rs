//! Operations: the steps inside a change.

use crate::error::{Result, StoreError};
use crate::model::{File, Snapshot, TextOperation};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub enum Operation {
    AddFile {
        pathname: String,
        file: File,
    },
    EditFile {
        pathname: String,
        text_operation: TextOperation,
        /// Expected SHA-1 of the file content after the edit. Only used for
        /// validation and dropped before the change is persisted.
        content_hash: Option<String>,
    },
    /// An empty `new_pathname` deletes the file.
    MoveFile {
        pathname: String,
        new_pathname: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum RawOperation {
    #[serde(rename_all = "camelCase")]
    AddFile { pathname: String, file: File },
    #[serde(rename_all = "camelCase")]
    EditFile {
        pathname: String,
        text_operation: TextOperation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MoveFile {
        pathname: String,
        new_pathname: String,
    },
}

impl Operation {
    pub fn add_file(pathname: impl Into<String>, file: File) -> Self {
        Operation::AddFile {
            pathname: pathname.into(),
            file,
        }
    }

    pub fn edit_file(pathname: impl Into<String>, text_operation: TextOperation) -> Self {
        Operation::EditFile {
            pathname: pathname.into(),
            text_operation,
            content_hash: None,
        }
    }

    pub fn move_file(pathname: impl Into<String>, new_pathname: impl Into<String>) -> Self {
        Operation::MoveFile {
            pathname: pathname.into(),
            new_pathname: new_pathname.into(),
        }
    }

    pub fn remove_file(pathname: impl Into<String>) -> Self {
        Self::move_file(pathname, "")
    }

    pub fn pathname(&self) -> &str {
        match self {
            Operation::AddFile { pathname, .. }
            | Operation::EditFile { pathname, .. }
            | Operation::MoveFile { pathname, .. } => pathname,
        }
    }

    /// Apply to a snapshot. In strict mode a reference to a missing file is
    /// an error; otherwise such operations are skipped.
    pub fn apply_to(&self, snapshot: &mut Snapshot, strict: bool) -> Result<()> {
        match self {
            Operation::AddFile { pathname, file } => snapshot.add_file(pathname, file.clone()),
            Operation::EditFile {
                pathname,
                text_operation,
                ..
            } => match snapshot.file_mut(pathname) {
                Some(file) => file.edit(text_operation),
                None if strict => Err(missing_file(pathname)),
                None => Ok(()),
            },
            Operation::MoveFile {
                pathname,
                new_pathname,
            } => {
                if snapshot.file(pathname).is_none() {
                    return if strict { Err(missing_file(pathname)) } else { Ok(()) };
                }
                if new_pathname.is_empty() {
                    snapshot.remove_file(pathname);
                    Ok(())
                } else {
                    snapshot.move_file(pathname, new_pathname)
                }
            }
        }
    }
}

fn missing_file(pathname: &str) -> StoreError {
    StoreError::InvalidChange(format!("file not found: {pathname}"))
}

impl TryFrom<RawOperation> for Operation {
    type Error = StoreError;

    fn try_from(raw: RawOperation) -> Result<Self> {
        Ok(match raw {
            RawOperation::AddFile { pathname, file } => Operation::AddFile { pathname, file },
            RawOperation::EditFile {
                pathname,
                text_operation,
                content_hash,
            } => Operation::EditFile {
                pathname,
                text_operation,
                content_hash,
            },
            RawOperation::MoveFile {
                pathname,
                new_pathname,
            } => Operation::MoveFile {
                pathname,
                new_pathname,
            },
        })
    }
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::AddFile { pathname, file } => RawOperation::AddFile { pathname, file },
            Operation::EditFile {
                pathname,
                text_operation,
                content_hash,
            } => RawOperation::EditFile {
                pathname,
                text_operation,
                content_hash,
            },
            Operation::MoveFile {
                pathname,
                new_pathname,
            } => RawOperation::MoveFile {
                pathname,
                new_pathname,
            },
        }
    }
}
