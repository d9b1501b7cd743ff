//! Request validation on top of the `validator` crate.
//!
//! Custom rules are plain functions usable from `#[validate(custom(...))]`;
//! their error messages are registered with the [`Validator`] in `zh` and
//! `en` and rendered by the error handler in the request locale.
//!
//! ```rust,ignore
//! #[derive(Deserialize, Validate)]
//! struct Register {
//!     #[validate(custom(function = "abe_core::validation::mobile"))]
//!     phone: String,
//!     #[validate(length(min = 8))]
//!     password: String,
//! }
//!
//! async fn register(ValidatedJson(body): ValidatedJson<Register>) -> Result<Json<()>, AbeError> { ... }
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequest, Request};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

use crate::config::ValidatorConfig;
use crate::error::{AbeError, ErrorDetail};

/// Largest request body [`ValidatedJson`] reads.
pub const MAX_JSON_BODY: usize = 2 * 1024 * 1024;

type RuleFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A named custom rule with its message templates.
///
/// Templates use `{0}` for the field name and `{1}` for the rule parameter.
#[derive(Clone)]
pub struct ValidationRule {
    tag: String,
    check: RuleFn,
    translations: HashMap<String, String>,
}

impl std::fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRule")
            .field("tag", &self.tag)
            .field("translations", &self.translations)
            .finish()
    }
}

impl ValidationRule {
    pub fn new<F>(tag: impl Into<String>, check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        ValidationRule {
            tag: tag.into(),
            check: Arc::new(check),
            translations: HashMap::new(),
        }
    }

    pub fn with_translation(mut self, locale: &str, template: impl Into<String>) -> Self {
        self.translations.insert(locale.to_string(), template.into());
        self
    }

    pub fn with_zh(self, template: impl Into<String>) -> Self {
        self.with_translation("zh", template)
    }

    pub fn with_en(self, template: impl Into<String>) -> Self {
        self.with_translation("en", template)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn check(&self, value: &str) -> bool {
        (self.check)(value)
    }

    fn template(&self, locale: &str) -> Option<&str> {
        self.translations
            .get(locale)
            .or_else(|| self.translations.get("en"))
            .map(String::as_str)
    }

    fn verify(&self) -> Result<(), AbeError> {
        if self.tag.is_empty() {
            return Err(AbeError::Internal("validation rule tag cannot be empty".into()));
        }
        for locale in ["zh", "en"] {
            if !self.translations.contains_key(locale) {
                return Err(AbeError::Internal(format!(
                    "validation rule '{}' is missing a {locale} translation",
                    self.tag
                )));
            }
        }
        Ok(())
    }
}

/// Registry of custom rules plus locale-aware error rendering.
#[derive(Clone)]
pub struct Validator {
    inner: Arc<ValidatorInner>,
}

struct ValidatorInner {
    locale: String,
    rules: RwLock<HashMap<String, ValidationRule>>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<String> = self.inner.rules.read().keys().cloned().collect();
        tags.sort();
        f.debug_struct("Validator")
            .field("locale", &self.inner.locale)
            .field("rules", &tags)
            .finish()
    }
}

impl Validator {
    /// Validator with the builtin rules registered.
    pub fn new(config: &ValidatorConfig) -> Self {
        let locale = normalize_locale(Some(&config.locale)).unwrap_or("zh").to_string();
        let validator = Validator {
            inner: Arc::new(ValidatorInner {
                locale,
                rules: RwLock::new(HashMap::new()),
            }),
        };
        for rule in builtin_rules() {
            validator.must_register_rule(rule);
        }
        validator
    }

    /// Default locale, `zh` or `en`.
    pub fn locale(&self) -> &str {
        &self.inner.locale
    }

    /// Register a custom rule. Both `zh` and `en` templates are required.
    pub fn register_rule(&self, rule: ValidationRule) -> Result<(), AbeError> {
        rule.verify()?;
        self.inner.rules.write().insert(rule.tag.clone(), rule);
        Ok(())
    }

    /// # Panics
    ///
    /// Panics when the rule is incomplete.
    pub fn must_register_rule(&self, rule: ValidationRule) {
        if let Err(err) = self.register_rule(rule) {
            panic!("failed to register validation rule: {err}");
        }
    }

    pub fn rule(&self, tag: &str) -> Option<ValidationRule> {
        self.inner.rules.read().get(tag).cloned()
    }

    /// Run a registered rule against a single value.
    pub fn check(&self, tag: &str, value: &str) -> Result<bool, AbeError> {
        self.rule(tag)
            .map(|rule| rule.check(value))
            .ok_or_else(|| AbeError::Internal(format!("unknown validation rule '{tag}'")))
    }

    pub fn validate<T: Validate>(&self, value: &T) -> Result<(), AbeError> {
        value.validate().map_err(AbeError::Validation)
    }

    /// Render `errors` as field details in `locale` (falls back to the
    /// default locale). Field names are lower-camel-cased; nested fields are
    /// joined with `.`.
    pub fn translate(&self, errors: &ValidationErrors, locale: Option<&str>) -> Vec<ErrorDetail> {
        let locale = normalize_locale(locale).unwrap_or(self.locale());
        let mut details = Vec::new();
        self.collect(errors, "", locale, &mut details);
        details
    }

    fn collect(&self, errors: &ValidationErrors, prefix: &str, locale: &str, out: &mut Vec<ErrorDetail>) {
        let mut fields: Vec<_> = errors.errors().iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (field, kind) in fields {
            let name = join_path(prefix, &lower_camel(field));
            match kind {
                ValidationErrorsKind::Field(errs) => {
                    for err in errs {
                        out.push(ErrorDetail::field(name.clone(), self.message(&name, err, locale)));
                    }
                }
                ValidationErrorsKind::Struct(nested) => self.collect(nested, &name, locale, out),
                ValidationErrorsKind::List(items) => {
                    for (index, nested) in items {
                        self.collect(nested, &format!("{name}[{index}]"), locale, out);
                    }
                }
            }
        }
    }

    fn message(&self, field: &str, err: &ValidationError, locale: &str) -> String {
        if let Some(message) = &err.message {
            return message.to_string();
        }
        let param = rule_param(err);
        if let Some(rule) = self.rule(&err.code) {
            if let Some(template) = rule.template(locale) {
                return fill(template, field, param.as_deref().unwrap_or_default());
            }
        }
        standard_message(&err.code, field, err, locale)
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn normalize_locale(locale: Option<&str>) -> Option<&'static str> {
    let locale = locale?.trim().to_ascii_lowercase();
    if locale.starts_with("zh") {
        Some("zh")
    } else if locale.starts_with("en") {
        Some("en")
    } else {
        None
    }
}

/// `user_name` → `userName`.
pub fn lower_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for (i, c) in name.chars().enumerate() {
        if c == '_' || c == '-' {
            upper = i > 0;
            continue;
        }
        if out.is_empty() {
            out.extend(c.to_lowercase());
        } else if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = false;
    }
    out
}

fn fill(template: &str, field: &str, param: &str) -> String {
    template.replace("{0}", field).replace("{1}", param)
}

fn rule_param(err: &ValidationError) -> Option<String> {
    err.params
        .get("param")
        .or_else(|| err.params.get("value"))
        .map(json_text)
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn param(err: &ValidationError, key: &str) -> Option<String> {
    err.params.get(key).map(json_text)
}

fn standard_message(code: &str, field: &str, err: &ValidationError, locale: &str) -> String {
    let zh = locale == "zh";
    let min = param(err, "min");
    let max = param(err, "max");
    let equal = param(err, "equal");
    match code {
        "required" => {
            if zh { format!("{field}为必填字段") } else { format!("{field} is a required field") }
        }
        "email" => {
            if zh { format!("{field}必须是一个有效的邮箱") } else { format!("{field} must be a valid email address") }
        }
        "url" => {
            if zh { format!("{field}必须是一个有效的URL") } else { format!("{field} must be a valid URL") }
        }
        "length" => match (equal, min, max) {
            (Some(eq), _, _) => {
                if zh { format!("{field}长度必须是{eq}") } else { format!("{field} must be {eq} characters long") }
            }
            (None, Some(min), Some(max)) => {
                if zh {
                    format!("{field}长度必须在{min}到{max}之间")
                } else {
                    format!("{field} must be between {min} and {max} characters long")
                }
            }
            (None, Some(min), None) => {
                if zh { format!("{field}长度必须至少为{min}") } else { format!("{field} must be at least {min} characters long") }
            }
            (None, None, Some(max)) => {
                if zh { format!("{field}长度不能超过{max}") } else { format!("{field} must be at most {max} characters long") }
            }
            _ => invalid(field, zh),
        },
        "range" => match (min, max) {
            (Some(min), Some(max)) => {
                if zh { format!("{field}必须在{min}到{max}之间") } else { format!("{field} must be between {min} and {max}") }
            }
            (Some(min), None) => {
                if zh { format!("{field}必须大于或等于{min}") } else { format!("{field} must be {min} or greater") }
            }
            (None, Some(max)) => {
                if zh { format!("{field}必须小于或等于{max}") } else { format!("{field} must be {max} or less") }
            }
            _ => invalid(field, zh),
        },
        "must_match" => {
            let other = param(err, "other").map(|o| lower_camel(&o)).unwrap_or_default();
            if zh { format!("{field}必须等于{other}") } else { format!("{field} must be equal to {other}") }
        }
        "contains" => {
            let needle = param(err, "needle").unwrap_or_default();
            if zh { format!("{field}必须包含文本'{needle}'") } else { format!("{field} must contain the text '{needle}'") }
        }
        "does_not_contain" => {
            let needle = param(err, "needle").unwrap_or_default();
            if zh { format!("{field}不能包含文本'{needle}'") } else { format!("{field} cannot contain the text '{needle}'") }
        }
        "regex" => {
            if zh { format!("{field}格式不正确") } else { format!("{field} has an invalid format") }
        }
        _ => invalid(field, zh),
    }
}

fn invalid(field: &str, zh: bool) -> String {
    if zh { format!("{field}无效") } else { format!("{field} is invalid") }
}

// ═══════════════════════════════════════════════════════════════
// Builtin rules
// ═══════════════════════════════════════════════════════════════

fn rule_error(tag: &'static str) -> ValidationError {
    ValidationError::new(tag)
}

pub fn is_mobile(value: &str) -> bool {
    let b = value.as_bytes();
    b.len() == 11 && b[0] == b'1' && (b'3'..=b'9').contains(&b[1]) && b[2..].iter().all(u8::is_ascii_digit)
}

/// 17 digits followed by a digit or `X`.
pub fn is_idcard(value: &str) -> bool {
    let b = value.as_bytes();
    b.len() == 18 && b[..17].iter().all(u8::is_ascii_digit) && (b[17].is_ascii_digit() || b[17] == b'X' || b[17] == b'x')
}

pub fn is_username(value: &str) -> bool {
    (3..=20).contains(&value.len()) && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn is_chinese_name(value: &str) -> bool {
    let count = value.chars().count();
    (2..=20).contains(&count) && value.chars().all(|c| ('\u{4e00}'..='\u{9fa5}').contains(&c))
}

pub fn is_strong_password(value: &str) -> bool {
    value.len() >= 8
        && value.chars().any(|c| c.is_ascii_uppercase())
        && value.chars().any(|c| c.is_ascii_lowercase())
        && value.chars().any(|c| c.is_ascii_digit())
}

macro_rules! rule_fn {
    ($($name:ident => $check:ident, $tag:literal;)*) => {
        $(
            #[doc = concat!("`#[validate(custom(function = \"", stringify!($name), "\"))]` for the `", $tag, "` rule.")]
            pub fn $name(value: &str) -> Result<(), ValidationError> {
                if $check(value) { Ok(()) } else { Err(rule_error($tag)) }
            }
        )*
    };
}

rule_fn! {
    mobile => is_mobile, "mobile";
    idcard => is_idcard, "idcard";
    username => is_username, "username";
    chinese_name => is_chinese_name, "chinese_name";
    strong_password => is_strong_password, "strong_password";
}

fn builtin_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::new("mobile", is_mobile)
            .with_zh("{0}必须是有效的手机号码")
            .with_en("{0} must be a valid mobile number"),
        ValidationRule::new("idcard", is_idcard)
            .with_zh("{0}必须是有效的身份证号码")
            .with_en("{0} must be a valid ID card number"),
        ValidationRule::new("username", is_username)
            .with_zh("{0}必须是3-20位字母数字下划线")
            .with_en("{0} must be 3-20 alphanumeric characters or underscore"),
        ValidationRule::new("chinese_name", is_chinese_name)
            .with_zh("{0}必须是2-20个中文字符")
            .with_en("{0} must be 2-20 Chinese characters"),
        ValidationRule::new("strong_password", is_strong_password)
            .with_zh("{0}必须至少8位，且包含大小写字母和数字")
            .with_en("{0} must be at least 8 characters with uppercase, lowercase and digits"),
    ]
}

// ═══════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════

/// JSON body that is deserialized and then validated.
///
/// Malformed bodies are rejected with [`AbeError::InvalidJson`]; rule
/// failures with [`AbeError::Validation`].
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AbeError;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::to_bytes(req.into_body(), MAX_JSON_BODY)
            .await
            .map_err(|e| AbeError::InvalidJson(format!("failed to read body: {e}")))?;

        let value: T = serde_json::from_slice(&bytes).map_err(|e| AbeError::InvalidJson(e.to_string()))?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

/// Attach a message to a custom-rule error.
pub fn with_message(mut err: ValidationError, message: impl Into<Cow<'static, str>>) -> ValidationError {
    err.message = Some(message.into());
    err
}
