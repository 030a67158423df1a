use crate::rule::Rule;
use crate::script::{ScriptBridge, field_expression};
use crate::traits::{FieldMap, Tab};

/// Run the rule's prepare gate, then every field in declaration order.
///
/// Each result is published to the page as `field_<name>` before the next
/// field runs. A closed prepare gate returns an empty map.
pub async fn extract_fields<T: Tab>(bridge: &ScriptBridge<'_, T>, rule: &Rule) -> FieldMap {
    let mut fields = FieldMap::with_capacity(rule.fields.len());

    if let Some(prepare) = &rule.prepare {
        if !bridge.prepare(prepare).await {
            tracing::info!(rule = %rule.id, "Prepare gate closed, skipping fields");
            return fields;
        }
    }

    for field in &rule.fields {
        let result = if !field.eval.is_empty() {
            Some(
                bridge
                    .eval_raw(&field_expression(&field.eval, &field.value))
                    .await,
            )
        } else if !field.value.is_empty() {
            Some(field.value.clone())
        } else {
            None
        };

        if let Some(value) = result {
            bridge.publish_field(&field.name, &value).await;
            tracing::debug!(rule = %rule.id, field = %field.name, bytes = value.len(), "Field extracted");
            fields.insert(field.name.clone(), value);
        }

        if !field.wait.is_zero() {
            tokio::time::sleep(field.wait).await;
        }
    }

    fields
}
