//! Termination detection.
//!
//! Decides, after every sampled token, whether a client's generation is done.
//! Nothing fires until the client has decoded more than `min_decoded` tokens,
//! which keeps a model that opens with EOS or a newline from producing empty
//! answers.

use serde::Serialize;

use crate::config::SchedulerConfig;

/// Reason a client stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The engine reported an end-of-generation token.
    EndOfGeneration,
    /// Prompt plus generated tokens reached the length budget.
    MaxTokens,
    /// The response contains the reverse prompt.
    ReversePrompt,
    /// The response contains a newline.
    Newline,
}

impl FinishReason {
    /// Short human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfGeneration => "eog",
            Self::MaxTokens => "max tokens",
            Self::ReversePrompt => "reverse prompt",
            Self::Newline => "newline",
        }
    }
}

/// Per-token stop policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCriteria {
    /// No stop fires while `n_decoded <= min_decoded`.
    pub min_decoded: usize,
    /// Prompt + generated token budget.
    pub n_predict: Option<usize>,
    /// Marker ending the response.
    pub reverse_prompt: Option<String>,
    /// Stop on the first newline.
    pub stop_on_newline: bool,
}

impl Default for StopCriteria {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl StopCriteria {
    /// Build the policy from scheduler settings. A zero budget means unlimited.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            min_decoded: config.min_decoded,
            n_predict: config.n_predict.filter(|&n| n > 0),
            reverse_prompt: config.reverse_prompt.clone().filter(|m| !m.is_empty()),
            stop_on_newline: config.stop_on_newline,
        }
    }

    /// Check whether generation should stop after the latest token.
    ///
    /// Conditions are checked in order: end of generation, length budget,
    /// reverse prompt, newline.
    pub fn check(
        &self,
        n_prompt: usize,
        n_decoded: usize,
        is_eog: bool,
        response: &str,
    ) -> Option<FinishReason> {
        if n_decoded <= self.min_decoded {
            return None;
        }

        if is_eog {
            return Some(FinishReason::EndOfGeneration);
        }

        if let Some(budget) = self.n_predict {
            if n_prompt + n_decoded >= budget {
                return Some(FinishReason::MaxTokens);
            }
        }

        if let Some(marker) = &self.reverse_prompt {
            if response.contains(marker.as_str()) {
                return Some(FinishReason::ReversePrompt);
            }
        }

        if self.stop_on_newline && response.contains('\n') {
            return Some(FinishReason::Newline);
        }

        None
    }

    /// Cut the response at the first reverse prompt, if present.
    pub fn truncate(&self, response: &mut String) {
        if let Some(marker) = &self.reverse_prompt {
            if let Some(pos) = response.find(marker.as_str()) {
                response.truncate(pos);
            }
        }
    }
}
