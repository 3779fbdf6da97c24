pub mod sqlite;

pub use sqlite::{
    Db, DownloadLogEntry, MediaServer, ServerKind, ServerStatus, StrmLogEntry, SubTaskCounts,
    UploadRecord, UploadStatus,
};
