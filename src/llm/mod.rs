//! Language-model collaborator contract.
//!
//! The core consumes classification, personalization, adaptive rewriting and
//! detail extraction. Providers plug in behind [`LanguageModelService`]; the
//! [`DisabledLanguageModel`] stands in when none is configured, and every
//! call site falls back to a non-LLM path on error.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::leads::{Channel, Lead, LeadId};

/// Label assigned to an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyLabel {
    Interested,
    NotInterested,
    Question,
    Unsubscribe,
    OutOfOffice,
    Other,
    /// Classification failed; a human has to read it.
    ManualReview,
}

impl ReplyLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "INTERESTED",
            Self::NotInterested => "NOT_INTERESTED",
            Self::Question => "QUESTION",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::OutOfOffice => "OUT_OF_OFFICE",
            Self::Other => "OTHER",
            Self::ManualReview => "MANUAL_REVIEW",
        }
    }
}

impl fmt::Display for ReplyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyLabel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERESTED" => Ok(Self::Interested),
            "NOT_INTERESTED" => Ok(Self::NotInterested),
            "QUESTION" => Ok(Self::Question),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "OUT_OF_OFFICE" => Ok(Self::OutOfOffice),
            "OTHER" => Ok(Self::Other),
            "MANUAL_REVIEW" => Ok(Self::ManualReview),
            _ => Err(format!("Unknown reply label: {s}")),
        }
    }
}

/// Result of classifying a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: ReplyLabel,
    /// 0.0..=1.0
    pub confidence: f32,
    pub summary: String,
}

/// Result of an adaptive rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adaptation {
    pub adapted: bool,
    pub content: String,
}

#[async_trait]
pub trait LanguageModelService: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, LlmError>;

    /// Rewrite `template` for this lead. Placeholders may be left in place.
    async fn personalize(
        &self,
        lead: &Lead,
        template: &str,
        channel: Channel,
    ) -> Result<String, LlmError>;

    /// Rewrite `template` given the conversation so far with `lead_id`.
    async fn adapt(
        &self,
        template: &str,
        lead_id: LeadId,
        channel: Channel,
    ) -> Result<Adaptation, LlmError>;

    /// Pull structured details (summary, objection, buying signals) from a reply.
    async fn extract_details(
        &self,
        text: &str,
        context: &str,
    ) -> Result<HashMap<String, String>, LlmError>;
}

/// Used when no provider is configured. Every call reports `NotConfigured`.
pub struct DisabledLanguageModel;

#[async_trait]
impl LanguageModelService for DisabledLanguageModel {
    async fn classify(&self, _text: &str) -> Result<Classification, LlmError> {
        Err(LlmError::NotConfigured)
    }

    async fn personalize(
        &self,
        _lead: &Lead,
        _template: &str,
        _channel: Channel,
    ) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }

    async fn adapt(
        &self,
        _template: &str,
        _lead_id: LeadId,
        _channel: Channel,
    ) -> Result<Adaptation, LlmError> {
        Err(LlmError::NotConfigured)
    }

    async fn extract_details(
        &self,
        _text: &str,
        _context: &str,
    ) -> Result<HashMap<String, String>, LlmError> {
        Err(LlmError::NotConfigured)
    }
}
