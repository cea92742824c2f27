use serde::{Deserialize, Serialize};

use super::build::BuildResult;

/// A message pushed to a preview connection.
///
/// Serializes as `{"state":"building"}` or
/// `{"state":"finished","result":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PreviewMessage {
    Building,
    Finished { result: PreviewResult },
}

/// The `result` of a finished preview message.
///
/// A successful build carries this session's artifact; a failed one carries
/// the global build output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PreviewResult {
    Rendered { success: bool, content: String },
    Failed(BuildResult),
}

impl PreviewMessage {
    pub fn rendered(content: impl Into<String>) -> Self {
        Self::Finished {
            result: PreviewResult::Rendered {
                success: true,
                content: content.into(),
            },
        }
    }

    pub fn failed(result: BuildResult) -> Self {
        Self::Finished {
            result: PreviewResult::Failed(result),
        }
    }
}
