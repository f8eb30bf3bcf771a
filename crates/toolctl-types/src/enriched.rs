use serde::{Deserialize, Serialize};

use crate::recipe::{ChoiceRecord, ChoiceType, Risk};

/// A choice option enriched with a computed availability. Options are never
/// dropped — an unavailable option stays in the list, greyed, with the
/// reason attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedOption {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub available: bool,
    pub disabled_reason: Option<String>,
    pub enable_hint: Option<String>,
    pub learn_more: Option<String>,
    pub failed_constraint: Option<String>,
    pub all_failures: Vec<String>,
    pub auto_selected: bool,
    pub risk: Option<Risk>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedChoice {
    pub id: String,
    pub label: String,
    pub choice_type: ChoiceType,
    pub options: Vec<EnrichedOption>,
}

impl EnrichedChoice {
    pub fn from_record(record: &ChoiceRecord, options: Vec<EnrichedOption>) -> EnrichedChoice {
        EnrichedChoice {
            id: record.id.clone(),
            label: record.label.clone(),
            choice_type: record.choice_type,
            options,
        }
    }
}
