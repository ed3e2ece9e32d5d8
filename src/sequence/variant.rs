//! Stable A/B variant assignment per (step, lead).

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::leads::LeadId;
use crate::sequence::model::Step;
use crate::store::Database;

/// Content picked for a step, with the variant label if the step has variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedContent {
    pub content: String,
    pub variant: Option<String>,
}

pub struct VariantAssignor {
    db: Arc<dyn Database>,
}

impl VariantAssignor {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Return the lead's variant for this step, assigning one at random the
    /// first time. Repeated calls return the same variant.
    pub async fn select(
        &self,
        step: &Step,
        lead_id: LeadId,
    ) -> Result<SelectedContent, DatabaseError> {
        if step.variants.is_empty() {
            return Ok(SelectedContent {
                content: step.content.clone().unwrap_or_default(),
                variant: None,
            });
        }

        let name = match self.db.get_variant_assignment(step.id, lead_id).await? {
            Some(existing) => existing,
            None => {
                let pick = step
                    .variants
                    .choose(&mut rand::thread_rng())
                    .map(|v| v.name.clone())
                    .unwrap_or_default();
                let stored = self.db.assign_variant(step.id, lead_id, &pick).await?;
                debug!(step = step.id, lead_id, variant = %stored, "Variant assigned");
                stored
            }
        };

        let content = match step.variants.iter().find(|v| v.name == name) {
            Some(variant) => variant.content.clone(),
            None => {
                // The sequence was edited after assignment; keep the label stable.
                warn!(step = step.id, lead_id, variant = %name, "Assigned variant no longer exists");
                step.variants
                    .first()
                    .map(|v| v.content.clone())
                    .unwrap_or_default()
            }
        };

        Ok(SelectedContent {
            content,
            variant: Some(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::{Channel, NewLead};
    use crate::sequence::model::Variant;
    use crate::store::LibSqlBackend;

    fn ab_step() -> Step {
        Step {
            id: 2,
            channel: Channel::Email,
            delay_days: 2,
            content: None,
            variants: vec![
                Variant {
                    name: "A".into(),
                    content: "Version A".into(),
                },
                Variant {
                    name: "B".into(),
                    content: "Version B".into(),
                },
            ],
            condition: None,
        }
    }

    async fn setup() -> (Arc<dyn Database>, LeadId) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = db.insert_lead(&NewLead::default()).await.unwrap();
        (db, lead.id)
    }

    #[tokio::test]
    async fn selection_is_sticky() {
        let (db, lead_id) = setup().await;
        let assignor = VariantAssignor::new(Arc::clone(&db));
        let step = ab_step();

        let first = assignor.select(&step, lead_id).await.unwrap();
        for _ in 0..20 {
            assert_eq!(assignor.select(&step, lead_id).await.unwrap(), first);
        }
        let label = first.variant.unwrap();
        assert!(label == "A" || label == "B");
        assert_eq!(first.content, format!("Version {label}"));
    }

    #[tokio::test]
    async fn no_variants_returns_step_content() {
        let (db, lead_id) = setup().await;
        let assignor = VariantAssignor::new(Arc::clone(&db));
        let mut step = ab_step();
        step.variants.clear();
        step.content = Some("Plain".into());

        let selected = assignor.select(&step, lead_id).await.unwrap();
        assert_eq!(selected.content, "Plain");
        assert!(selected.variant.is_none());
        assert!(
            db.get_variant_assignment(step.id, lead_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn existing_assignment_wins() {
        let (db, lead_id) = setup().await;
        db.assign_variant(2, lead_id, "B").await.unwrap();
        let assignor = VariantAssignor::new(Arc::clone(&db));

        let selected = assignor.select(&ab_step(), lead_id).await.unwrap();
        assert_eq!(selected.variant.as_deref(), Some("B"));
        assert_eq!(selected.content, "Version B");
    }

    #[tokio::test]
    async fn removed_variant_keeps_label() {
        let (db, lead_id) = setup().await;
        db.assign_variant(2, lead_id, "C").await.unwrap();
        let assignor = VariantAssignor::new(Arc::clone(&db));

        let selected = assignor.select(&ab_step(), lead_id).await.unwrap();
        assert_eq!(selected.variant.as_deref(), Some("C"));
        assert_eq!(selected.content, "Version A");
    }
}
