//! Agent 能力清单（由 Agent Card 解析而来）

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RegistryError;

/// Agent 声明的一项技能
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 能力清单：端点、名称、能力与技能
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentManifest {
    pub endpoint: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capabilities: Vec<String>,
    pub skills: Vec<Skill>,
}

impl AgentManifest {
    /// 从 `/.well-known/agent.json` 的内容解析
    ///
    /// capabilities 可以是布尔映射（取值为 true 的键）或字符串列表；name 与 capabilities 必须存在
    pub fn from_card(endpoint: &str, card: &Value) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidCard {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };

        let name = card
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| invalid("missing name"))?;

        let capabilities = match card.get("capabilities") {
            Some(Value::Object(map)) => map
                .iter()
                .filter(|(_, v)| v.as_bool().unwrap_or(false) || v.is_object())
                .map(|(k, _)| k.clone())
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect(),
            _ => return Err(invalid("missing capabilities")),
        };

        let skills = card
            .get("skills")
            .and_then(Value::as_array)
            .map(|skills| {
                skills
                    .iter()
                    .filter_map(|s| serde_json::from_value::<Skill>(s.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            endpoint: endpoint.to_string(),
            name: name.to_string(),
            description: card
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            capabilities,
            skills,
        })
    }

    /// 大小写不敏感的子串匹配：能力、技能 id / 名称 / 标签、Agent 名称与描述
    pub fn matches(&self, text: &str) -> bool {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        let hit = |s: &str| s.to_lowercase().contains(&needle);

        hit(&self.name)
            || hit(&self.description)
            || self.capabilities.iter().any(|c| hit(c))
            || self.skills.iter().any(|s| {
                hit(&s.id) || hit(&s.name) || hit(&s.description) || s.tags.iter().any(|t| hit(t))
            })
    }

    /// 摘要行，供推理上下文使用
    pub fn summary(&self) -> String {
        let mut line = format!("- {} ({}): {}", self.name, self.endpoint, self.description);
        if !self.skills.is_empty() {
            let names: Vec<&str> = self.skills.iter().map(|s| s.name.as_str()).collect();
            line.push_str(&format!("\n  Skills: {}", names.join(", ")));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn currency_card() -> Value {
        json!({
            "name": "Currency Agent",
            "description": "Converts between currencies",
            "url": "http://localhost:10000",
            "capabilities": { "streaming": true, "pushNotifications": false },
            "skills": [{
                "id": "convert_currency",
                "name": "Currency Exchange Rates Tool",
                "description": "Helps with exchange values between various currencies",
                "tags": ["currency conversion", "currency exchange"],
                "examples": ["What is exchange rate between USD and GBP?"]
            }]
        })
    }

    #[test]
    fn test_parse_card_with_bool_capabilities() {
        let manifest = AgentManifest::from_card("http://localhost:10000", &currency_card()).unwrap();
        assert_eq!(manifest.name, "Currency Agent");
        assert_eq!(manifest.capabilities, vec!["streaming".to_string()]);
        assert_eq!(manifest.skills.len(), 1);
        assert_eq!(manifest.skills[0].tags.len(), 2);
    }

    #[test]
    fn test_parse_card_with_list_capabilities() {
        let card = json!({ "name": "Clock", "capabilities": ["time", "timezone"] });
        let manifest = AgentManifest::from_card("http://clock", &card).unwrap();
        assert_eq!(manifest.capabilities, vec!["time", "timezone"]);
        assert!(manifest.skills.is_empty());
    }

    #[test]
    fn test_card_requires_name_and_capabilities() {
        assert!(AgentManifest::from_card("e", &json!({ "capabilities": [] })).is_err());
        assert!(AgentManifest::from_card("e", &json!({ "name": "x" })).is_err());
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let manifest = AgentManifest::from_card("http://localhost:10000", &currency_card()).unwrap();
        assert!(manifest.matches("CURRENCY"));
        assert!(manifest.matches("exchange"));
        assert!(!manifest.matches("hotel"));
        assert!(!manifest.matches("  "));
    }

    #[test]
    fn test_summary() {
        let manifest = AgentManifest::from_card("http://localhost:10000", &currency_card()).unwrap();
        assert_eq!(
            manifest.summary(),
            "- Currency Agent (http://localhost:10000): Converts between currencies\n  Skills: Currency Exchange Rates Tool"
        );
    }
}
