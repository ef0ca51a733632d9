//! Wire shapes of the portal's JSON API, spelled the way the portal spells them.

use jtt_core::{EntityDetail, EntitySummary, FieldMap};
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ProtocolError, RecoverableFetchError};

/// Body of every challenge-token request, and the challenge fetch response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeProtocol {
    #[serde(default)]
    pub captcha_key: String,
    pub captcha_image: Option<String>,
    pub user_code: Option<String>,
}

impl ChallengeProtocol {
    /// Body for bootstrap/detail requests: current token, no image, empty code.
    pub fn with_token(captcha_key: &str) -> Self {
        Self {
            captcha_key: captcha_key.to_string(),
            captcha_image: None,
            user_code: Some(String::new()),
        }
    }

    pub fn answer(captcha_key: String, user_code: String) -> Self {
        Self {
            captcha_key,
            captcha_image: None,
            user_code: Some(user_code),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResult {
    #[serde(default)]
    pub captcha_matched: bool,
    #[serde(default)]
    pub captcha_key: String,
}

/// Response to the bootstrap POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootstrapResponse {
    #[serde(rename = "captchaRequred")]
    pub captcha_required: Option<bool>,
    #[serde(rename = "captchaKey")]
    pub captcha_key: Option<String>,
    #[serde(rename = "offenderViewKey")]
    pub view_key: Option<JsonValue>,
    pub offenders: Option<Vec<FieldMap>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecialField {
    #[serde(rename = "labelText", default)]
    pub label: String,
    #[serde(rename = "offenderValue", default)]
    pub value: Option<String>,
}

/// Response to the per-entity detail POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetailResponse {
    #[serde(rename = "captchaRequred")]
    pub captcha_required: Option<bool>,
    #[serde(rename = "captchaKey")]
    pub captcha_key: Option<String>,
    #[serde(rename = "offenderViewKey")]
    pub view_key: Option<JsonValue>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub cases: Option<Vec<FieldMap>>,
    #[serde(default)]
    pub charges: Option<Vec<FieldMap>>,
    #[serde(default)]
    pub holds: Option<Vec<FieldMap>>,
    #[serde(rename = "offenderSpecialFields", default)]
    pub special_fields: Option<Vec<SpecialField>>,
}

/// Token set every challenge-token response must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTokens {
    pub challenge_required: bool,
    pub challenge_key: String,
    pub view_key: String,
}

fn required_tokens(
    captcha_required: Option<bool>,
    captcha_key: Option<&String>,
    view_key: Option<&JsonValue>,
    context: &'static str,
) -> Result<ResponseTokens, ProtocolError> {
    let missing = |field| ProtocolError::MissingField { field, context };
    let challenge_required = captcha_required.ok_or_else(|| missing("captchaRequred"))?;
    let challenge_key = captcha_key.cloned().ok_or_else(|| missing("captchaKey"))?;
    let view_key = view_key
        .and_then(view_key_text)
        .ok_or_else(|| missing("offenderViewKey"))?;
    Ok(ResponseTokens {
        challenge_required,
        challenge_key,
        view_key,
    })
}

impl BootstrapResponse {
    pub fn tokens(&self) -> Result<ResponseTokens, ProtocolError> {
        required_tokens(
            self.captcha_required,
            self.captcha_key.as_ref(),
            self.view_key.as_ref(),
            "bootstrap",
        )
    }
}

impl DetailResponse {
    pub fn tokens(&self) -> Result<ResponseTokens, ProtocolError> {
        required_tokens(
            self.captcha_required,
            self.captcha_key.as_ref(),
            self.view_key.as_ref(),
            "detail",
        )
    }

    pub fn detail(&self) -> EntityDetail {
        let pairs = self.special_fields.iter().flatten().map(|f| {
            (
                normalize_label(&f.label),
                unescape(f.value.as_deref().unwrap_or_default()),
            )
        });
        EntityDetail::from_pairs(pairs)
    }
}

/// The portal sends the view key as a number on some deployments, a string on others.
pub fn view_key_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Listing/sub-resource envelope used by the plain-cookie endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(rename = "totalCount", default)]
    pub total_count: Option<u64>,
}

impl Envelope {
    pub fn into_rows(self) -> Result<Vec<JsonValue>, RecoverableFetchError> {
        if let Some(message) = self.error.as_deref().map(str::trim) {
            if !message.is_empty() {
                return Err(RecoverableFetchError::PortalError(message.to_string()));
            }
        }
        if self.success != Some(true) {
            return Err(RecoverableFetchError::Unsuccessful);
        }
        match self.data {
            Some(JsonValue::Array(rows)) if !rows.is_empty() => Ok(rows),
            Some(JsonValue::Object(obj)) if !obj.is_empty() => Ok(vec![JsonValue::Object(obj)]),
            _ => Err(RecoverableFetchError::EmptyData),
        }
    }
}

/// Rows must be JSON objects.
pub fn rows_to_field_maps(rows: Vec<JsonValue>) -> Result<Vec<FieldMap>, RecoverableFetchError> {
    rows.into_iter()
        .map(|row| match row {
            JsonValue::Object(obj) => Ok(obj.into_iter().collect()),
            other => Err(RecoverableFetchError::Malformed(format!(
                "expected object row, got {other}"
            ))),
        })
        .collect()
}

/// `[{Field, Value}]` pairs into a flat, unescaped detail mapping.
pub fn pairs_to_detail(rows: &[JsonValue]) -> Result<EntityDetail, RecoverableFetchError> {
    let mut detail = EntityDetail::new();
    for row in rows {
        let label = string_field(row, &["Field", "field"])
            .ok_or_else(|| RecoverableFetchError::Malformed(format!("pair without Field: {row}")))?;
        let value = string_field(row, &["Value", "value"]).unwrap_or_default();
        detail.insert(normalize_label(&label), unescape(&value));
    }
    Ok(detail)
}

fn string_field(row: &JsonValue, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match row.get(*name)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    })
}

pub const IDENTIFIER_FIELDS: [&str; 2] = ["arrestNo", "ArrestNo"];

/// Listing rows into summaries; every row must carry an identifier.
pub fn rows_to_summaries(
    rows: Vec<FieldMap>,
    context: &'static str,
) -> Result<Vec<EntitySummary>, ProtocolError> {
    rows.into_iter()
        .map(|fields| {
            let identifier = IDENTIFIER_FIELDS
                .iter()
                .find_map(|name| fields.get(*name).and_then(identifier_text))
                .ok_or(ProtocolError::MissingField {
                    field: "arrestNo",
                    context,
                })?;
            Ok(EntitySummary { identifier, fields })
        })
        .collect()
}

fn identifier_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_label(label: &str) -> String {
    unescape(label).trim().trim_end_matches(':').trim().to_string()
}

/// Decodes HTML entities (and drops stray markup) in a portal value.
pub fn unescape(raw: &str) -> String {
    if !raw.contains('&') && !raw.contains('<') {
        return raw.trim().to_string();
    }
    let fragment = Html::parse_fragment(raw);
    fragment
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unescape_decodes_entities() {
        assert_eq!(unescape("O&#39;NEIL"), "O'NEIL");
        assert_eq!(unescape("BURGLARY &amp; LARCENY "), "BURGLARY & LARCENY");
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(unescape("<b>BOLD</b>"), "BOLD");
    }

    #[test]
    fn challenge_body_serializes_with_null_image() {
        let body = serde_json::to_value(ChallengeProtocol::with_token("KEY")).unwrap();
        assert_eq!(
            body,
            json!({"captchaKey": "KEY", "captchaImage": null, "userCode": ""})
        );
    }

    #[test]
    fn detail_tokens_accept_numeric_or_string_view_keys() {
        let numeric: DetailResponse = serde_json::from_value(json!({
            "captchaRequred": false, "captchaKey": "K", "offenderViewKey": 939027534
        }))
        .unwrap();
        assert_eq!(numeric.tokens().unwrap().view_key, "939027534");

        let text: DetailResponse = serde_json::from_value(json!({
            "captchaRequred": true, "captchaKey": "K", "offenderViewKey": "abc"
        }))
        .unwrap();
        let tokens = text.tokens().unwrap();
        assert!(tokens.challenge_required);
        assert_eq!(tokens.view_key, "abc");
    }

    #[test]
    fn missing_tokens_are_protocol_errors() {
        let resp: DetailResponse =
            serde_json::from_value(json!({"captchaRequred": false, "offenderViewKey": 1})).unwrap();
        let err = resp.tokens().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingField {
                field: "captchaKey",
                ..
            }
        ));
    }

    #[test]
    fn special_fields_become_detail() {
        let resp: DetailResponse = serde_json::from_value(json!({
            "offenderSpecialFields": [
                {"labelText": "Booking Date:", "offenderValue": "6/28/2024 10:22:44 AM"},
                {"labelText": "Arresting Agency", "offenderValue": "Circuit &amp; County"},
                {"labelText": "Sched Release", "offenderValue": null}
            ]
        }))
        .unwrap();
        let detail = resp.detail();
        assert_eq!(detail.get("Booking Date"), Some("6/28/2024 10:22:44 AM"));
        assert_eq!(detail.get("Arresting Agency"), Some("Circuit & County"));
        assert_eq!(detail.get("Sched Release"), Some(""));
    }

    #[test]
    fn envelope_failures_are_distinct() {
        let env = |v: JsonValue| serde_json::from_value::<Envelope>(v).unwrap().into_rows();
        assert!(matches!(
            env(json!({"success": false, "data": [1]})),
            Err(RecoverableFetchError::Unsuccessful)
        ));
        assert!(matches!(
            env(json!({"success": true, "error": "Session expired", "data": [1]})),
            Err(RecoverableFetchError::PortalError(m)) if m == "Session expired"
        ));
        assert!(matches!(
            env(json!({"success": true, "error": "", "data": []})),
            Err(RecoverableFetchError::EmptyData)
        ));
        assert_eq!(
            env(json!({"success": true, "data": [{"a": 1}]})).unwrap().len(),
            1
        );
    }

    #[test]
    fn pairs_are_flattened() {
        let rows = vec![
            json!({"Field": "Last Name:", "Value": "DOE"}),
            json!({"Field": "Address", "Value": "123 Main &amp; 4th"}),
        ];
        let detail = pairs_to_detail(&rows).unwrap();
        assert_eq!(detail.get("Last Name"), Some("DOE"));
        assert_eq!(detail.get("Address"), Some("123 Main & 4th"));
        assert!(pairs_to_detail(&[json!({"Value": "x"})]).is_err());
    }

    #[test]
    fn summaries_need_identifiers() {
        let mut row = FieldMap::new();
        row.insert("arrestNo".into(), json!(49949));
        let summaries = rows_to_summaries(vec![row], "listing").unwrap();
        assert_eq!(summaries[0].identifier, "49949");

        let mut bad = FieldMap::new();
        bad.insert("jacket".into(), json!("J1"));
        assert!(rows_to_summaries(vec![bad], "listing").is_err());
    }
}
