//! Error classification.
//!
//! The control plane reports "this resource does not exist" in many ways: a
//! plain 404, a 400 with a parameter error code, a 403 with an access-denied
//! code, sometimes even a 500. Classification rewrites those vendor errors
//! into the canonical [`OperationError::NotFound`] so that read and delete
//! logic can treat absence uniformly.
//!
//! Rules are plain data. Each resource owns its rule table:
//!
//! ```
//! use hemmer_reconcile::classify::{classify, ClassificationRule};
//! use hemmer_reconcile::OperationError;
//!
//! let rules = [ClassificationRule::new(403, "errCode", "CSS.0015")];
//! let err = OperationError::UnexpectedStatus {
//!     status: 403,
//!     body: r#"{"errCode":"CSS.0015","externalMessage":"cluster not found"}"#.to_string(),
//! };
//! assert!(classify(err, &rules).is_not_found());
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OperationError, ReconcileError};
use crate::query::path_search;

/// A declarative mapping from a vendor error to "resource absent".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// HTTP status the error must carry.
    pub expected_status: u16,
    /// Query locating the error code in the response body.
    pub error_code_path: String,
    /// Accepted error codes. Empty means the status alone is enough.
    #[serde(default)]
    pub expected_codes: Vec<String>,
    /// Substring the error message must contain, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_contains: Option<String>,
}

impl ClassificationRule {
    /// Create a rule matching one error code.
    pub fn new(
        expected_status: u16,
        error_code_path: impl Into<String>,
        expected_code: impl Into<String>,
    ) -> Self {
        Self {
            expected_status,
            error_code_path: error_code_path.into(),
            expected_codes: vec![expected_code.into()],
            message_contains: None,
        }
    }

    /// Create a rule matching any of several error codes.
    pub fn any_of<I, S>(expected_status: u16, error_code_path: impl Into<String>, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected_status,
            error_code_path: error_code_path.into(),
            expected_codes: codes.into_iter().map(Into::into).collect(),
            message_contains: None,
        }
    }

    /// Create a rule matching on status alone.
    pub fn status(expected_status: u16) -> Self {
        Self {
            expected_status,
            error_code_path: String::new(),
            expected_codes: Vec::new(),
            message_contains: None,
        }
    }

    /// Require the error message to contain `needle`.
    pub fn with_message(mut self, needle: impl Into<String>) -> Self {
        self.message_contains = Some(needle.into());
        self
    }

    /// Whether `err` matches this rule.
    ///
    /// Only [`OperationError::UnexpectedStatus`] and
    /// [`OperationError::ServiceResponse`] can match.
    pub fn matches(&self, err: &OperationError) -> bool {
        let (status, body, decoded_code, message) = match err {
            OperationError::UnexpectedStatus { status, body } => {
                (*status, body.as_str(), None, body.as_str())
            },
            OperationError::ServiceResponse {
                status,
                code,
                message,
                body,
            } => (*status, body.as_str(), Some(code.as_str()), message.as_str()),
            _ => return false,
        };

        if status != self.expected_status {
            return false;
        }

        if let Some(needle) = &self.message_contains {
            if !message.contains(needle.as_str()) && !body.contains(needle.as_str()) {
                return false;
            }
        }

        if self.expected_codes.is_empty() {
            return true;
        }

        let code = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(tree) => match path_search(&self.error_code_path, &tree) {
                Ok(serde_json::Value::String(code)) => Some(code),
                Ok(serde_json::Value::Number(code)) => Some(code.to_string()),
                Ok(_) => None,
                Err(err) => {
                    debug!(error = %err, path = %self.error_code_path, "Invalid error code path");
                    None
                },
            },
            Err(err) => {
                debug!(status, error = %err, "Error body is not JSON");
                decoded_code.map(str::to_string)
            },
        };

        code.is_some_and(|code| self.expected_codes.iter().any(|expected| *expected == code))
    }
}

/// Rewrite `err` into [`OperationError::NotFound`] if any rule matches.
///
/// Rules are tried in order and the first match wins. When nothing matches the
/// original error is returned unchanged.
pub fn classify(err: OperationError, rules: &[ClassificationRule]) -> OperationError {
    match rules.iter().find(|rule| rule.matches(&err)) {
        Some(rule) => {
            debug!(
                status = rule.expected_status,
                codes = ?rule.expected_codes,
                "Classified error as not found"
            );
            OperationError::NotFound(not_found_message(&err))
        },
        None => err,
    }
}

/// Apply [`classify`] to the error side of a result.
pub fn classify_result<T>(
    result: Result<T, OperationError>,
    rules: &[ClassificationRule],
) -> Result<T, OperationError> {
    result.map_err(|err| classify(err, rules))
}

/// Turn a "resource absent" error into `Ok(None)`.
///
/// Reads of a vanished resource and deletes of an already deleted resource
/// both go through this so that they succeed instead of failing the apply.
pub fn check_deleted<T>(result: Result<T, ReconcileError>) -> Result<Option<T>, ReconcileError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => {
            debug!(error = %err, "Resource is gone");
            Ok(None)
        },
        Err(err) => Err(err),
    }
}

fn not_found_message(err: &OperationError) -> String {
    match err {
        OperationError::ServiceResponse {
            status,
            code,
            message,
            ..
        } => format!("status {} with error code {}: {}", status, code, message),
        OperationError::UnexpectedStatus { status, body } => {
            format!("status {}: {}", status, body)
        },
        other => other.to_string(),
    }
}

/// An ordered, chainable set of classification rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Classifier {
    /// Create an empty classifier, which leaves every error unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append every rule of `other` after this classifier's rules.
    pub fn then(mut self, other: Classifier) -> Self {
        self.rules.extend(other.rules);
        self
    }

    /// The rules in evaluation order.
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify an error with this rule set.
    pub fn classify(&self, err: OperationError) -> OperationError {
        classify(err, &self.rules)
    }
}

impl From<Vec<ClassificationRule>> for Classifier {
    fn from(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unexpected(status: u16, body: &str) -> OperationError {
        OperationError::UnexpectedStatus {
            status,
            body: body.to_string(),
        }
    }

    fn css_rule() -> ClassificationRule {
        ClassificationRule::new(403, "errCode", "CSS.0015")
    }

    #[test]
    fn test_matching_code_becomes_not_found() {
        let err = unexpected(
            403,
            r#"{"errCode":"CSS.0015","externalMessage":"cluster does not exist"}"#,
        );
        let classified = classify(err, &[css_rule()]);
        assert!(classified.is_not_found());
        assert!(classified.message().contains("403"));
    }

    #[test]
    fn test_other_code_is_unchanged() {
        let err = unexpected(403, r#"{"errCode":"CSS.9999"}"#);
        assert_eq!(classify(err.clone(), &[css_rule()]), err);
    }

    #[test]
    fn test_status_mismatch_is_unchanged() {
        let err = unexpected(400, r#"{"errCode":"CSS.0015"}"#);
        assert_eq!(classify(err.clone(), &[css_rule()]), err);
    }

    #[test]
    fn test_unparsable_body_is_unchanged() {
        let err = unexpected(403, "<html>forbidden</html>");
        assert_eq!(classify(err.clone(), &[css_rule()]), err);
    }

    #[test]
    fn test_nested_code_path() {
        let rule = ClassificationRule::new(400, "errors|[0].error_code", "DLF.0100");
        let err = unexpected(400, r#"{"errors":[{"error_code":"DLF.0100"}]}"#);
        assert!(classify(err, &[rule]).is_not_found());
    }

    #[test]
    fn test_any_of_codes() {
        let rule = ClassificationRule::any_of(400, "error_code", ["MRS.0011", "MRS.0037"]);
        assert!(rule.matches(&unexpected(400, r#"{"error_code":"MRS.0037"}"#)));
        assert!(!rule.matches(&unexpected(400, r#"{"error_code":"MRS.0001"}"#)));
    }

    #[test]
    fn test_message_substring() {
        let rule = ClassificationRule::new(400, "error_code", "APIG.2000")
            .with_message("does not exist");
        assert!(rule.matches(&unexpected(
            400,
            r#"{"error_code":"APIG.2000","error_msg":"The API does not exist"}"#
        )));
        assert!(!rule.matches(&unexpected(
            400,
            r#"{"error_code":"APIG.2000","error_msg":"Parameter error"}"#
        )));
    }

    #[test]
    fn test_service_response_uses_decoded_code_without_json_body() {
        let err = OperationError::ServiceResponse {
            status: 403,
            code: "CSS.0015".to_string(),
            message: "cluster does not exist".to_string(),
            body: String::new(),
        };
        assert!(classify(err, &[css_rule()]).is_not_found());
    }

    #[test]
    fn test_code_only_at_other_path_is_unchanged() {
        let err = OperationError::ServiceResponse {
            status: 403,
            code: "CSS.0015".to_string(),
            message: "other".to_string(),
            body: r#"{"error_code":"CSS.0015","error_msg":"other"}"#.to_string(),
        };
        assert_eq!(classify(err.clone(), &[css_rule()]), err);

        let rule = ClassificationRule::new(403, "error_code", "CSS.0015");
        assert!(classify(err, &[rule]).is_not_found());
    }

    #[test]
    fn test_status_only_rule() {
        let rule = ClassificationRule::status(404);
        assert!(rule.matches(&unexpected(404, "")));
        assert!(!rule.matches(&unexpected(400, "")));
    }

    #[test]
    fn test_first_match_wins_and_fallback() {
        let rules = [
            ClassificationRule::new(400, "error_code", "DCS.4133"),
            css_rule(),
        ];
        assert!(classify(unexpected(403, r#"{"errCode":"CSS.0015"}"#), &rules).is_not_found());

        let transport = OperationError::Transport("connection reset".to_string());
        assert_eq!(classify(transport.clone(), &rules), transport);
    }

    #[test]
    fn test_classify_is_idempotent() {
        let rules = [css_rule(), ClassificationRule::status(404)];
        let inputs = [
            unexpected(403, r#"{"errCode":"CSS.0015"}"#),
            unexpected(403, r#"{"errCode":"CSS.9999"}"#),
            unexpected(404, "not found"),
            OperationError::Transport("eof".to_string()),
            OperationError::NotFound("already".to_string()),
        ];
        for err in inputs {
            let once = classify(err, &rules);
            let twice = classify(once.clone(), &rules);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_check_deleted() {
        let gone: Result<u8, ReconcileError> = Err(ReconcileError::operation(
            "cluster",
            "show cluster",
            OperationError::NotFound("c-1".to_string()),
        ));
        assert!(check_deleted(gone).unwrap().is_none());

        let present: Result<u8, ReconcileError> = Ok(7);
        assert_eq!(check_deleted(present).unwrap(), Some(7));

        let failed: Result<u8, ReconcileError> = Err(ReconcileError::operation(
            "cluster",
            "show cluster",
            OperationError::Transport("eof".to_string()),
        ));
        assert!(check_deleted(failed).is_err());
    }

    #[test]
    fn test_classifier_chaining() {
        let classifier = Classifier::new()
            .with_rule(ClassificationRule::new(400, "error_code", "WKS.0001"))
            .then(Classifier::from(vec![ClassificationRule::status(404)]));
        assert_eq!(classifier.rules().len(), 2);
        assert!(classifier.classify(unexpected(404, "")).is_not_found());
        assert!(classifier
            .classify(unexpected(400, r#"{"error_code":"WKS.0001"}"#))
            .is_not_found());

        let err = unexpected(500, "boom");
        assert_eq!(Classifier::new().classify(err.clone()), err);
    }

    #[test]
    fn test_classify_result() {
        let ok: Result<u8, OperationError> = Ok(1);
        assert_eq!(classify_result(ok, &[css_rule()]), Ok(1));

        let err: Result<u8, OperationError> = Err(unexpected(403, r#"{"errCode":"CSS.0015"}"#));
        assert!(classify_result(err, &[css_rule()]).unwrap_err().is_not_found());
    }
}
