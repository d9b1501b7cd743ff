mod common;

use std::sync::Arc;

use abe_core::axum::body::Body;
use abe_core::axum::http::{Request, StatusCode};
use abe_core::config::I18nConfig;
use abe_core::i18n::{Bundle, error_message_id, parse_accept_language};
use abe_core::prelude::*;
use serde_json::{Value, json};

use common::{engine, mount, send};

fn bundle() -> Arc<Bundle> {
    Arc::new(Bundle::load(&I18nConfig::default()))
}

// ═══ Negotiation ═══

#[test]
fn test_accept_language_ordering() {
    assert_eq!(
        parse_accept_language("fr;q=0.5, en-US, zh-CN;q=0.8, *;q=0.1"),
        ["en-US", "zh-CN", "fr"]
    );
    assert!(parse_accept_language("").is_empty());
}

#[test]
fn test_match_language_by_primary_subtag() {
    let bundle = bundle();
    assert_eq!(bundle.languages(), ["en", "zh"]);
    assert_eq!(bundle.default_language(), "zh");
    assert_eq!(bundle.match_language("en_GB").as_deref(), Some("en"));
    assert_eq!(bundle.match_language("ZH-cn").as_deref(), Some("zh"));
    assert_eq!(bundle.match_language("de"), None);
}

#[test]
fn test_localizer_falls_back_through_candidates() {
    let localizer = Localizer::new(bundle(), &["de".to_string(), "en-US".to_string()]);
    assert_eq!(localizer.language(), Some("en"));
    assert_eq!(localizer.localize("error.forbidden", &[]), "forbidden");
    assert_eq!(localizer.localize("greeting", &[("name", "Ada")]), "Hello, Ada!");
    assert_eq!(localizer.localize("no.such.id", &[]), "no.such.id");

    let fallback = Localizer::new(bundle(), &["de".to_string()]);
    assert_eq!(fallback.language(), Some("zh"));
    assert_eq!(fallback.localize("error.forbidden", &[]), "权限不足");
}

#[test]
fn test_passthrough_returns_ids() {
    let localizer = Localizer::passthrough();
    assert_eq!(localizer.language(), None);
    assert_eq!(localizer.localize("error.forbidden", &[]), "error.forbidden");
}

#[test]
fn test_catalog_shapes() {
    let mut bundle = Bundle::new("en");
    let count = bundle
        .add_messages(
            "en",
            "plain: \"Plain\"\nplural:\n  other: \"Many\"\norder:\n  shipped: \"Order {{id}} shipped\"\n",
        )
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(bundle.message("en", "plain"), Some("Plain"));
    assert_eq!(bundle.message("en", "plural"), Some("Many"));
    assert_eq!(bundle.message("en", "order.shipped"), Some("Order {{id}} shipped"));

    // later catalogs override earlier ids
    bundle.add_messages("en", "plain: \"Replaced\"").unwrap();
    assert_eq!(bundle.message("en", "plain"), Some("Replaced"));
    assert!(bundle.add_messages("en", "[not: valid").is_err());
}

#[test]
fn test_catalog_files_from_directory() {
    let dir = std::env::temp_dir().join(format!("abe-i18n-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("active.fr.yaml"), "error.forbidden: \"interdit\"\n").unwrap();
    std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

    let bundle = Bundle::load(&I18nConfig {
        enabled: true,
        paths: vec![dir.display().to_string()],
        ..I18nConfig::default()
    });
    assert_eq!(bundle.languages(), ["en", "fr", "zh"]);
    assert_eq!(bundle.message("fr", "error.forbidden"), Some("interdit"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_error_message_ids() {
    assert_eq!(error_message_id(&AbeError::Forbidden("x".into())), Some("error.forbidden"));
    assert_eq!(error_message_id(&AbeError::TokenExpired), Some("error.token_expired"));
    assert_eq!(error_message_id(&AbeError::Internal("x".into())), Some("error.internal"));
    assert_eq!(error_message_id(&AbeError::not_found("order")), None);
}

// ═══ Middleware ═══

async fn describe(locale: Locale, localizer: Localizer) -> Json<Value> {
    Json(json!({
        "locale": locale.as_str(),
        "greeting": localizer.localize("greeting", &[("name", "Ada")]),
    }))
}

async fn denied() -> Result<(), AbeError> {
    Err(AbeError::Forbidden("no".into()))
}

fn routes(router: Router<Engine>) -> Router<Engine> {
    router.route("/hello", get(describe)).route("/denied", get(denied))
}

fn request(uri: &str, accept_language: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(lang) = accept_language {
        builder = builder.header("accept-language", lang);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_header_selects_language() {
    let engine = engine("i18n:\n  enabled: true\n").await;
    let app = mount(&engine, routes);

    let reply = send(&app, request("/hello", Some("en-US,en;q=0.9"))).await;
    assert_eq!(reply.body["locale"], "en");
    assert_eq!(reply.body["greeting"], "Hello, Ada!");
}

#[tokio::test]
async fn test_query_overrides_header() {
    let engine = engine("i18n:\n  enabled: true\n").await;
    let app = mount(&engine, routes);

    let reply = send(&app, request("/hello?lang=zh", Some("en"))).await;
    assert_eq!(reply.body["locale"], "zh");
    assert_eq!(reply.body["greeting"], "你好，Ada！");
}

#[tokio::test]
async fn test_default_language_applies() {
    let engine = engine("i18n:\n  enabled: true\n  default_language: en\n").await;
    let app = mount(&engine, routes);

    let reply = send(&app, request("/hello", None)).await;
    assert_eq!(reply.body["locale"], "en");
}

#[tokio::test]
async fn test_error_messages_are_translated() {
    let engine = engine("i18n:\n  enabled: true\n").await;
    let app = mount(&engine, routes);

    let zh = send(&app, request("/denied", Some("zh-CN"))).await;
    assert_eq!(zh.status, StatusCode::FORBIDDEN);
    assert_eq!(zh.body["code"], 2101);
    assert_eq!(zh.body["message"], "权限不足");

    let en = send(&app, request("/denied", Some("en"))).await;
    assert_eq!(en.body["message"], "forbidden");
}

#[tokio::test]
async fn test_disabled_i18n_keeps_plain_messages() {
    let engine = engine("{}").await;
    let app = mount(&engine, routes);

    let reply = send(&app, request("/hello", Some("en"))).await;
    assert_eq!(reply.body["locale"], "en");
    assert_eq!(reply.body["greeting"], "greeting");

    let denied = send(&app, request("/denied", Some("zh"))).await;
    assert_eq!(denied.body["message"], "forbidden");
}
