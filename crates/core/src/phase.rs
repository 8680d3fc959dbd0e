use serde::{Deserialize, Serialize};

/// Named stages of the ingestion pipeline.
///
/// Phase transitions are recorded with durations in the progress tracker's
/// phase history, so the status API can show where a job spent its time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
  Initializing,
  Analyzing,
  Parsing,
  Extracting,
  Chunking,
  Embedding,
  Storing,
  Finalizing,
  Completed,
  Error,
  Paused,
  Cancelled,
}

impl ProcessingPhase {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProcessingPhase::Initializing => "initializing",
      ProcessingPhase::Analyzing => "analyzing",
      ProcessingPhase::Parsing => "parsing",
      ProcessingPhase::Extracting => "extracting",
      ProcessingPhase::Chunking => "chunking",
      ProcessingPhase::Embedding => "embedding",
      ProcessingPhase::Storing => "storing",
      ProcessingPhase::Finalizing => "finalizing",
      ProcessingPhase::Completed => "completed",
      ProcessingPhase::Error => "error",
      ProcessingPhase::Paused => "paused",
      ProcessingPhase::Cancelled => "cancelled",
    }
  }

  /// Terminal phases never transition to anything else.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ProcessingPhase::Completed | ProcessingPhase::Error | ProcessingPhase::Cancelled
    )
  }
}

impl std::fmt::Display for ProcessingPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn serializes_snake_case() {
    let json = serde_json::to_string(&ProcessingPhase::Embedding).unwrap();
    assert_eq!(json, "\"embedding\"");
    let back: ProcessingPhase = serde_json::from_str("\"storing\"").unwrap();
    assert_eq!(back, ProcessingPhase::Storing);
  }

  #[test]
  fn terminal_phases() {
    assert!(ProcessingPhase::Completed.is_terminal());
    assert!(ProcessingPhase::Cancelled.is_terminal());
    assert!(!ProcessingPhase::Paused.is_terminal());
    assert!(!ProcessingPhase::Parsing.is_terminal());
  }
}
