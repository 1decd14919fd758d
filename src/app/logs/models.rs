use serde::{Deserialize, Serialize};

use crate::logs::{LogRecord, LogStatus};

#[derive(Deserialize, Clone, Debug, Default)]
pub struct LogListParams {
    /// Most recent N records; all retained records when absent.
    pub limit: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct DisconnectParams {
    #[serde(default)]
    pub clear: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LevelRequest {
    pub level: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct LogListResponse {
    pub records: Vec<LogRecord>,
    pub status: LogStatus,
}
