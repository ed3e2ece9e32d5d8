//! Template filling, adaptive rewrites and channel rendering.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use tracing::{debug, warn};
use url::Url;

use crate::leads::{Channel, Lead};
use crate::llm::LanguageModelService;
use crate::sequence::model::Step;
use crate::store::Database;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap());

static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+"#).unwrap());

/// An industry hook chosen by substring match on `product_interest`.
pub struct IndustryHook {
    pub keywords: &'static [&'static str],
    pub hook: &'static str,
}

/// Ordered; the first matching entry wins.
pub static INDUSTRY_HOOKS: &[IndustryHook] = &[
    IndustryHook {
        keywords: &["solar", "energy", "battery"],
        hook: "With energy costs where they are, a lot of owners are rethinking their setup.",
    },
    IndustryHook {
        keywords: &["roof", "gutter", "siding"],
        hook: "Storm season is a good moment to get ahead of exterior repairs.",
    },
    IndustryHook {
        keywords: &["hvac", "heating", "cooling", "air"],
        hook: "Most HVAC issues show up right when the weather turns.",
    },
    IndustryHook {
        keywords: &["insurance", "coverage", "policy"],
        hook: "Rates moved a lot this year, so a quick coverage review usually pays off.",
    },
    IndustryHook {
        keywords: &["software", "saas", "crm", "automation"],
        hook: "Teams your size usually lose hours a week to manual follow-up.",
    },
];

const DEFAULT_HOOK: &str = "I work with a few businesses nearby and had an idea that might help.";

/// Hook text for a product interest.
pub fn industry_hook(product_interest: Option<&str>) -> &'static str {
    let Some(interest) = product_interest.map(str::to_lowercase) else {
        return DEFAULT_HOOK;
    };
    INDUSTRY_HOOKS
        .iter()
        .find(|h| h.keywords.iter().any(|k| interest.contains(k)))
        .map(|h| h.hook)
        .unwrap_or(DEFAULT_HOOK)
}

pub struct ContentResolver {
    db: Arc<dyn Database>,
    llm: Arc<dyn LanguageModelService>,
    booking_link: Option<String>,
    tracking_base_url: Option<String>,
}

impl ContentResolver {
    pub fn new(
        db: Arc<dyn Database>,
        llm: Arc<dyn LanguageModelService>,
        booking_link: Option<String>,
        tracking_base_url: Option<String>,
    ) -> Self {
        Self {
            db,
            llm,
            booking_link,
            tracking_base_url,
        }
    }

    /// Final text for `step`. Leads that have replied get an adaptive rewrite
    /// first; any rewrite failure falls back to `selected`.
    pub async fn resolve(&self, step: &Step, lead: &Lead, selected: &str) -> String {
        let has_replied = match self.db.has_inbound_message(lead.id).await {
            Ok(replied) => replied,
            Err(e) => {
                warn!(lead_id = lead.id, error = %e, "Could not check replies, using template as-is");
                false
            }
        };

        let template = if has_replied {
            match self.llm.adapt(selected, lead.id, step.channel).await {
                Ok(adaptation) if adaptation.adapted => {
                    debug!(lead_id = lead.id, step = step.id, "Using adapted template");
                    adaptation.content
                }
                Ok(_) => selected.to_string(),
                Err(e) => {
                    warn!(lead_id = lead.id, error = %e, "Adaptive rewrite failed, using original template");
                    selected.to_string()
                }
            }
        } else {
            selected.to_string()
        };

        self.fill_placeholders(&template, lead)
    }

    /// Substitute `{{name}}` placeholders. Unknown placeholders are left as-is.
    pub fn fill_placeholders(&self, template: &str, lead: &Lead) -> String {
        PLACEHOLDER.replace_all(template, |caps: &Captures| {
            let value = match &caps[1] {
                "firstName" => Some(non_empty(lead.first_name.as_deref()).unwrap_or("there")),
                "lastName" => Some(non_empty(lead.last_name.as_deref()).unwrap_or("")),
                "company" => Some(non_empty(lead.company.as_deref()).unwrap_or("your company")),
                "city" => Some(non_empty(lead.city.as_deref()).unwrap_or("your area")),
                "bookingLink" => Some(self.booking_link.as_deref().unwrap_or("")),
                "industryHook" => Some(industry_hook(lead.product_interest.as_deref())),
                _ => None,
            };
            match value {
                Some(v) => v.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
    }

    /// Channel-specific rendering applied after templating: tracked links for
    /// SMS, an open pixel for EMAIL. No-op without a tracking base URL.
    pub fn render_for_channel(&self, channel: Channel, lead: &Lead, content: &str) -> String {
        let Some(base) = self.tracking_base_url.as_deref() else {
            return content.to_string();
        };
        match channel {
            Channel::Sms => self.wrap_links(base, lead, content),
            Channel::Email => match tracking_url(base, "/t/open", lead, None) {
                Some(pixel) => format!(
                    "{content}\n<img src=\"{pixel}\" width=\"1\" height=\"1\" alt=\"\" />"
                ),
                None => content.to_string(),
            },
            _ => content.to_string(),
        }
    }

    fn wrap_links(&self, base: &str, lead: &Lead, content: &str) -> String {
        LINK.replace_all(content, |caps: &Captures| {
            tracking_url(base, "/t/click", lead, Some(&caps[0]))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn tracking_url(base: &str, path: &str, lead: &Lead, target: Option<&str>) -> Option<String> {
    let mut url = Url::parse(&format!("{base}{path}")).ok()?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("lead", &lead.id.to_string());
        if let Some(target) = target {
            query.append_pair("url", target);
        }
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::LlmError;
    use crate::leads::{LeadId, LeadMemory, LeadStatus, FunnelStage, Message, NewLead};
    use crate::llm::{Adaptation, Classification, DisabledLanguageModel};
    use crate::store::LibSqlBackend;

    struct RewritingModel;

    #[async_trait]
    impl LanguageModelService for RewritingModel {
        async fn classify(&self, _text: &str) -> Result<Classification, LlmError> {
            Err(LlmError::NotConfigured)
        }
        async fn personalize(
            &self,
            _lead: &Lead,
            template: &str,
            _channel: Channel,
        ) -> Result<String, LlmError> {
            Ok(template.to_string())
        }
        async fn adapt(
            &self,
            _template: &str,
            _lead_id: LeadId,
            _channel: Channel,
        ) -> Result<Adaptation, LlmError> {
            Ok(Adaptation {
                adapted: true,
                content: "Thanks for getting back to me, {{firstName}}!".into(),
            })
        }
        async fn extract_details(
            &self,
            _text: &str,
            _context: &str,
        ) -> Result<HashMap<String, String>, LlmError> {
            Ok(HashMap::new())
        }
    }

    fn lead() -> Lead {
        let now = Utc::now();
        Lead {
            id: 42,
            first_name: Some("Dana".into()),
            last_name: Some("Reyes".into()),
            email: Some("dana@example.com".into()),
            phone: None,
            company: None,
            city: Some("Austin".into()),
            product_interest: Some("Residential Solar".into()),
            status: LeadStatus::Active,
            step: 1,
            funnel_stage: FunnelStage::Contacted,
            stage_locked: false,
            stage_changed_at: None,
            last_contacted_at: None,
            last_activity_at: None,
            memory: LeadMemory::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn step() -> Step {
        Step {
            id: 1,
            channel: Channel::Sms,
            delay_days: 0,
            content: Some("Hi {{firstName}}".into()),
            variants: Vec::new(),
            condition: None,
        }
    }

    async fn resolver(
        llm: Arc<dyn LanguageModelService>,
        tracking: Option<&str>,
    ) -> (Arc<dyn Database>, ContentResolver) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let resolver = ContentResolver::new(
            Arc::clone(&db),
            llm,
            Some("https://cal.example.com/dana".into()),
            tracking.map(String::from),
        );
        (db, resolver)
    }

    #[tokio::test]
    async fn fills_known_placeholders_with_fallbacks() {
        let (_db, resolver) = resolver(Arc::new(DisabledLanguageModel), None).await;
        let out = resolver.fill_placeholders(
            "Hi {{ firstName }} at {{company}} in {{city}}: {{industryHook}} {{bookingLink}} {{mystery}}",
            &lead(),
        );
        assert!(out.starts_with("Hi Dana at your company in Austin: With energy costs"));
        assert!(out.contains("https://cal.example.com/dana"));
        assert!(out.ends_with("{{mystery}}"));
    }

    #[tokio::test]
    async fn missing_first_name_falls_back() {
        let (_db, resolver) = resolver(Arc::new(DisabledLanguageModel), None).await;
        let mut lead = lead();
        lead.first_name = Some("  ".into());
        assert_eq!(resolver.fill_placeholders("Hi {{firstName}}", &lead), "Hi there");
    }

    #[test]
    fn template_patterns_compile() {
        let caps = PLACEHOLDER.captures("Hi {{ firstName }}").unwrap();
        assert_eq!(&caps[1], "firstName");
        assert_eq!(
            LINK.find("see https://acme.example/p?q=1 today").unwrap().as_str(),
            "https://acme.example/p?q=1"
        );
    }

    #[test]
    fn hook_table_matches_substrings() {
        assert!(industry_hook(Some("Commercial HVAC service")).contains("HVAC"));
        assert_eq!(industry_hook(None), DEFAULT_HOOK);
        assert_eq!(industry_hook(Some("pottery")), DEFAULT_HOOK);
    }

    #[tokio::test]
    async fn no_reply_skips_adaptive_path() {
        let (db, resolver) = resolver(Arc::new(RewritingModel), None).await;
        let stored = db.insert_lead(&NewLead::default()).await.unwrap();
        let mut lead = lead();
        lead.id = stored.id;

        let out = resolver.resolve(&step(), &lead, "Hi {{firstName}}").await;
        assert_eq!(out, "Hi Dana");
    }

    #[tokio::test]
    async fn replied_lead_gets_adapted_content() {
        let (db, resolver) = resolver(Arc::new(RewritingModel), None).await;
        let stored = db.insert_lead(&NewLead::default()).await.unwrap();
        db.insert_message(&Message::inbound(stored.id, Channel::Sms, "Tell me more", None))
            .await
            .unwrap();
        let mut lead = lead();
        lead.id = stored.id;

        let out = resolver.resolve(&step(), &lead, "Hi {{firstName}}").await;
        assert_eq!(out, "Thanks for getting back to me, Dana!");
    }

    #[tokio::test]
    async fn adapt_failure_falls_back_to_template() {
        let (db, resolver) = resolver(Arc::new(DisabledLanguageModel), None).await;
        let stored = db.insert_lead(&NewLead::default()).await.unwrap();
        db.insert_message(&Message::inbound(stored.id, Channel::Sms, "Tell me more", None))
            .await
            .unwrap();
        let mut lead = lead();
        lead.id = stored.id;

        let out = resolver.resolve(&step(), &lead, "Hi {{firstName}}").await;
        assert_eq!(out, "Hi Dana");
    }

    #[tokio::test]
    async fn sms_links_are_wrapped() {
        let (_db, resolver) = resolver(Arc::new(DisabledLanguageModel), Some("https://t.example.com")).await;
        let out = resolver.render_for_channel(
            Channel::Sms,
            &lead(),
            "Book here: https://cal.example.com/dana?x=1 thanks",
        );
        assert!(out.starts_with("Book here: https://t.example.com/t/click?lead=42&url=https%3A%2F%2Fcal.example.com%2Fdana%3Fx%3D1"));
        assert!(out.ends_with(" thanks"));
    }

    #[tokio::test]
    async fn email_gets_open_pixel() {
        let (_db, resolver) = resolver(Arc::new(DisabledLanguageModel), Some("https://t.example.com")).await;
        let out = resolver.render_for_channel(Channel::Email, &lead(), "Hello");
        assert!(out.starts_with("Hello\n<img src=\"https://t.example.com/t/open?lead=42\""));
    }

    #[tokio::test]
    async fn rendering_is_noop_without_tracking() {
        let (_db, resolver) = resolver(Arc::new(DisabledLanguageModel), None).await;
        let text = "See https://example.com";
        assert_eq!(resolver.render_for_channel(Channel::Sms, &lead(), text), text);
        assert_eq!(resolver.render_for_channel(Channel::Call, &lead(), text), text);
    }
}
