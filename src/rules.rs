//! Pure decision functions for resource combination and placement.
//!
//! Nothing in here mutates state or touches the store; every function is
//! referentially transparent so the whole matrix can be unit tested without
//! a board or a session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::model::{AttachmentRule, DropRule, Resource, ResourceCategory};

/// The complete permission matrix: which types may combine, which rows
/// admit which types, and how concrete types map onto categories.
///
/// Loadable from YAML so site configurations ship as plain files.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RuleSet {
    pub attachment_rules: Vec<AttachmentRule>,
    pub drop_rules: Vec<DropRule>,
    pub categories: HashMap<String, ResourceCategory>,
}

impl RuleSet {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn category_of(&self, resource_type: &str) -> Option<ResourceCategory> {
        self.categories.get(resource_type).copied()
    }

    /// Canonical attachment direction for a dragged pair.
    ///
    /// Mixed pairs always read personnel -> machinery regardless of which
    /// side was dragged; same-category pairs keep interaction order.
    pub fn resolve_direction<'a>(
        &self,
        a: &'a Resource,
        b: &'a Resource,
    ) -> (&'a Resource, &'a Resource) {
        let a_personnel = self
            .category_of(&a.resource_type)
            .map(|c| c.is_personnel())
            .unwrap_or(false);
        let b_personnel = self
            .category_of(&b.resource_type)
            .map(|c| c.is_personnel())
            .unwrap_or(false);

        if b_personnel && !a_personnel {
            (b, a)
        } else {
            (a, b)
        }
    }

    pub fn rule_for(&self, source_type: &str, target_type: &str) -> Option<&AttachmentRule> {
        self.attachment_rules
            .iter()
            .find(|r| r.source_type == source_type && r.target_type == target_type)
    }

    /// Whether one more `source_type` may attach to a target that already
    /// carries `current_count` of them.
    pub fn can_attach(
        &self,
        source_type: &str,
        target_type: &str,
        current_count: i32,
    ) -> Result<(), ValidationError> {
        let rule = self.rule_for(source_type, target_type).ok_or_else(|| {
            ValidationError::RuleNotFound {
                source_type: source_type.to_string(),
                target_type: target_type.to_string(),
            }
        })?;

        if !rule.can_attach {
            return Err(ValidationError::AttachmentDisallowed {
                source_type: source_type.to_string(),
                target_type: target_type.to_string(),
            });
        }

        if current_count >= rule.max_count {
            return Err(ValidationError::CapacityExceeded {
                source_type: source_type.to_string(),
                target_type: target_type.to_string(),
                max_count: rule.max_count,
            });
        }

        Ok(())
    }

    /// Whether `resource_type` may occupy `row_type`. Rows without a drop
    /// rule are unrestricted.
    pub fn can_drop(&self, resource_type: &str, row_type: &str) -> Result<(), ValidationError> {
        match self.drop_rules.iter().find(|r| r.row_type == row_type) {
            None => Ok(()),
            Some(rule) if rule.allowed_types.iter().any(|t| t == resource_type) => Ok(()),
            Some(_) => Err(ValidationError::DropDisallowed {
                resource_type: resource_type.to_string(),
                row_type: row_type.to_string(),
            }),
        }
    }

    /// How many more `source_type` the target type can still take.
    pub fn remaining_capacity(
        &self,
        source_type: &str,
        target_type: &str,
        current_count: i32,
    ) -> i32 {
        match self.rule_for(source_type, target_type) {
            Some(rule) if rule.can_attach => (rule.max_count - current_count).max(0),
            _ => 0,
        }
    }

    /// Source types a target of this type must carry to count as complete.
    pub fn required_source_types(&self, target_type: &str) -> Vec<&str> {
        self.attachment_rules
            .iter()
            .filter(|r| r.target_type == target_type && r.is_required && r.can_attach)
            .map(|r| r.source_type.as_str())
            .collect()
    }

    /// Source types that may attach to a target of this type at all.
    pub fn attachable_source_types(&self, target_type: &str) -> Vec<&str> {
        self.attachment_rules
            .iter()
            .filter(|r| r.target_type == target_type && r.can_attach)
            .map(|r| r.source_type.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;

    fn test_rules() -> RuleSet {
        let mut categories = HashMap::new();
        categories.insert("operator".to_string(), ResourceCategory::Personnel);
        categories.insert("screwman".to_string(), ResourceCategory::Personnel);
        categories.insert("excavator".to_string(), ResourceCategory::Equipment);
        categories.insert("paver".to_string(), ResourceCategory::Equipment);
        categories.insert("truck".to_string(), ResourceCategory::Vehicle);

        RuleSet {
            attachment_rules: vec![
                AttachmentRule {
                    source_type: "operator".to_string(),
                    target_type: "excavator".to_string(),
                    can_attach: true,
                    is_required: true,
                    max_count: 1,
                },
                AttachmentRule {
                    source_type: "screwman".to_string(),
                    target_type: "paver".to_string(),
                    can_attach: true,
                    is_required: false,
                    max_count: 2,
                },
                AttachmentRule {
                    source_type: "operator".to_string(),
                    target_type: "truck".to_string(),
                    can_attach: false,
                    is_required: false,
                    max_count: 0,
                },
            ],
            drop_rules: vec![DropRule {
                row_type: "Equipment".to_string(),
                allowed_types: vec!["excavator".to_string(), "paver".to_string()],
            }],
            categories,
        }
    }

    #[test]
    fn test_resolve_direction_mixed_pair_is_personnel_first() {
        let rules = test_rules();
        let operator = Resource::new("operator", "Jan", "OP1");
        let excavator = Resource::new("excavator", "EX-210", "EX1");

        // Drag order must not matter for mixed pairs
        let (s, t) = rules.resolve_direction(&operator, &excavator);
        assert_eq!(s.id, operator.id);
        assert_eq!(t.id, excavator.id);

        let (s, t) = rules.resolve_direction(&excavator, &operator);
        assert_eq!(s.id, operator.id);
        assert_eq!(t.id, excavator.id);
    }

    #[test]
    fn test_resolve_direction_same_category_keeps_order() {
        let rules = test_rules();
        let paver = Resource::new("paver", "PV-1", "PV1");
        let excavator = Resource::new("excavator", "EX-210", "EX1");

        let (s, t) = rules.resolve_direction(&paver, &excavator);
        assert_eq!(s.id, paver.id);
        assert_eq!(t.id, excavator.id);
    }

    #[test]
    fn test_can_attach_walks_the_failure_ladder() {
        let rules = test_rules();

        assert!(rules.can_attach("operator", "excavator", 0).is_ok());

        let err = rules.can_attach("operator", "excavator", 1).unwrap_err();
        assert_eq!(err.error_code(), "CAPACITY_EXCEEDED");

        let err = rules.can_attach("operator", "truck", 0).unwrap_err();
        assert_eq!(err.error_code(), "ATTACHMENT_DISALLOWED");

        let err = rules.can_attach("screwman", "excavator", 0).unwrap_err();
        assert_eq!(err.error_code(), "RULE_NOT_FOUND");
    }

    #[test]
    fn test_can_drop() {
        let rules = test_rules();
        assert!(rules.can_drop("excavator", "Equipment").is_ok());
        let err = rules.can_drop("truck", "Equipment").unwrap_err();
        assert_eq!(err.error_code(), "DROP_DISALLOWED");
        // Rows without a rule are unrestricted
        assert!(rules.can_drop("truck", "Transport").is_ok());
    }

    #[test]
    fn test_remaining_capacity() {
        let rules = test_rules();
        assert_eq!(rules.remaining_capacity("screwman", "paver", 0), 2);
        assert_eq!(rules.remaining_capacity("screwman", "paver", 2), 0);
        assert_eq!(rules.remaining_capacity("screwman", "paver", 5), 0);
        assert_eq!(rules.remaining_capacity("operator", "truck", 0), 0);
        assert_eq!(rules.remaining_capacity("nobody", "paver", 0), 0);
    }

    #[test]
    fn test_required_source_types() {
        let rules = test_rules();
        assert_eq!(rules.required_source_types("excavator"), vec!["operator"]);
        assert!(rules.required_source_types("paver").is_empty());
    }

    #[test]
    fn test_yaml_round_trip() {
        let rules = test_rules();
        let yaml = rules.to_yaml().unwrap();
        let back = RuleSet::from_yaml(&yaml).unwrap();
        assert_eq!(back.attachment_rules, rules.attachment_rules);
        assert_eq!(back.drop_rules, rules.drop_rules);
        assert_eq!(back.categories.len(), rules.categories.len());
    }

    #[test]
    fn test_yaml_deserialization_from_config_file() {
        let yaml = r#"
attachment_rules:
  - source_type: operator
    target_type: excavator
    can_attach: true
    is_required: true
    max_count: 1
drop_rules:
  - row_type: Crew
    allowed_types: [operator, screwman]
categories:
  operator: personnel
  excavator: equipment
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.attachment_rules.len(), 1);
        assert_eq!(
            rules.category_of("operator"),
            Some(ResourceCategory::Personnel)
        );
        assert!(rules.can_drop("screwman", "Crew").is_ok());
    }
}
