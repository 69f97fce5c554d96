//! Request classification.
//!
//! Maps an inbound HTTP method and path onto the sensitivity category that
//! decides whether, and how strictly, the request is throttled.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensitivity category of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// Not throttled
    Unrestricted,
    /// Endpoints that drive text-to-speech, illustration, quiz or pre-generation work
    Generation,
    /// Character and recap chat submissions
    Chat,
}

impl EndpointType {
    /// Prefix used when building admission keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Unrestricted => "UNRESTRICTED",
            EndpointType::Generation => "GENERATION",
            EndpointType::Chat => "CHAT",
        }
    }

    /// Whether requests of this category go through the limiter at all.
    pub fn is_throttled(&self) -> bool {
        !matches!(self, EndpointType::Unrestricted)
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method set plus path pattern mapped to a category.
struct Route {
    methods: &'static [&'static str],
    pattern: Regex,
    category: EndpointType,
}

impl Route {
    fn new(methods: &'static [&'static str], pattern: &str, category: EndpointType) -> Self {
        Self {
            methods,
            pattern: Regex::new(pattern).expect("route patterns are valid regexes"),
            category,
        }
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) && self.pattern.is_match(path)
    }
}

static ROUTES: Lazy<Vec<Route>> = Lazy::new(|| {
    use EndpointType::{Chat, Generation};

    vec![
        Route::new(&["POST"], r"^/api/books/[^/]+/pregenerate$", Generation),
        Route::new(
            &["POST"],
            r"^/api/books/[^/]+/chapters/[^/]+/illustrations$",
            Generation,
        ),
        Route::new(
            &["POST"],
            r"^/api/books/[^/]+/chapters/[^/]+/quiz/generate$",
            Generation,
        ),
        Route::new(
            &["GET", "POST"],
            r"^/api/tts/books/[^/]+(/chapters/[^/]+(/paragraphs/\d+)?)?$",
            Generation,
        ),
        Route::new(&["POST"], r"^/api/books/[^/]+/characters/[^/]+/chat$", Chat),
        Route::new(&["POST"], r"^/api/books/[^/]+/recap/chat$", Chat),
    ]
});

/// Stateless classifier from (method, path) to [`EndpointType`].
#[derive(Debug, Clone, Default)]
pub struct RequestClassifier;

impl RequestClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a request.
    ///
    /// Never fails: a missing method or an unknown route is `Unrestricted`.
    pub fn classify(&self, method: Option<&str>, path: &str) -> EndpointType {
        let Some(method) = method else {
            return EndpointType::Unrestricted;
        };

        let path = normalize_path(path);
        ROUTES
            .iter()
            .find(|route| route.matches(method, path))
            .map(|route| route.category)
            .unwrap_or(EndpointType::Unrestricted)
    }
}

/// Drop the query string, fragment and a single trailing slash.
fn normalize_path(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let path = &path[..end];
    match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(method: &str, path: &str) -> EndpointType {
        RequestClassifier::new().classify(Some(method), path)
    }

    #[test]
    fn test_missing_method_is_unrestricted() {
        let classifier = RequestClassifier::new();
        assert_eq!(
            classifier.classify(None, "/api/books/42/pregenerate"),
            EndpointType::Unrestricted
        );
    }

    #[test]
    fn test_classify_generation_endpoints() {
        assert_eq!(classify("POST", "/api/books/42/pregenerate"), EndpointType::Generation);
        assert_eq!(
            classify("POST", "/api/books/42/chapters/7/illustrations"),
            EndpointType::Generation
        );
        assert_eq!(
            classify("POST", "/api/books/abc-def/chapters/ch-1/quiz/generate"),
            EndpointType::Generation
        );
    }

    #[test]
    fn test_classify_tts_endpoints() {
        assert_eq!(classify("POST", "/api/tts/books/42"), EndpointType::Generation);
        assert_eq!(classify("GET", "/api/tts/books/42/chapters/3"), EndpointType::Generation);
        assert_eq!(
            classify("GET", "/api/tts/books/42/chapters/3/paragraphs/12"),
            EndpointType::Generation
        );

        // Paragraph index must be numeric
        assert_eq!(
            classify("GET", "/api/tts/books/42/chapters/3/paragraphs/first"),
            EndpointType::Unrestricted
        );
    }

    #[test]
    fn test_classify_chat_endpoints() {
        assert_eq!(
            classify("POST", "/api/books/42/characters/holmes/chat"),
            EndpointType::Chat
        );
        assert_eq!(classify("POST", "/api/books/42/recap/chat"), EndpointType::Chat);
    }

    #[test]
    fn test_method_matters() {
        // Reading an illustration list or chat history is not throttled
        assert_eq!(
            classify("GET", "/api/books/42/chapters/7/illustrations"),
            EndpointType::Unrestricted
        );
        assert_eq!(
            classify("GET", "/api/books/42/characters/holmes/chat"),
            EndpointType::Unrestricted
        );
        assert_eq!(classify("DELETE", "/api/tts/books/42"), EndpointType::Unrestricted);
    }

    #[test]
    fn test_method_is_case_insensitive() {
        assert_eq!(classify("post", "/api/books/42/recap/chat"), EndpointType::Chat);
        assert_eq!(classify("Get", "/api/tts/books/1"), EndpointType::Generation);
    }

    #[test]
    fn test_query_string_and_trailing_slash() {
        assert_eq!(
            classify("POST", "/api/books/42/pregenerate?force=true"),
            EndpointType::Generation
        );
        assert_eq!(classify("POST", "/api/books/42/recap/chat/"), EndpointType::Chat);
        assert_eq!(classify("GET", "/api/tts/books/42#t=10"), EndpointType::Generation);
    }

    #[test]
    fn test_unrestricted_endpoints() {
        assert_eq!(classify("GET", "/api/books"), EndpointType::Unrestricted);
        assert_eq!(classify("GET", "/api/books/42"), EndpointType::Unrestricted);
        assert_eq!(classify("GET", "/api/books/42/chapters/3"), EndpointType::Unrestricted);
        assert_eq!(classify("GET", "/api/analytics/reading-time"), EndpointType::Unrestricted);
        assert_eq!(classify("GET", "/api/import/browse"), EndpointType::Unrestricted);
        assert_eq!(classify("POST", "/api/import/gutenberg/1342"), EndpointType::Unrestricted);
    }

    #[test]
    fn test_identifiers_are_single_segments() {
        assert_eq!(
            classify("POST", "/api/books/42/extra/pregenerate"),
            EndpointType::Unrestricted
        );
        assert_eq!(classify("POST", "/api/books//pregenerate"), EndpointType::Unrestricted);
        assert_eq!(
            classify("POST", "/prefix/api/books/42/pregenerate"),
            EndpointType::Unrestricted
        );
    }

    #[test]
    fn test_edge_cases() {
        assert_eq!(classify("POST", ""), EndpointType::Unrestricted);
        assert_eq!(classify("POST", "/"), EndpointType::Unrestricted);
        assert_eq!(classify("", "/api/books/42/pregenerate"), EndpointType::Unrestricted);
    }

    #[test]
    fn test_endpoint_type_as_str() {
        assert_eq!(EndpointType::Unrestricted.as_str(), "UNRESTRICTED");
        assert_eq!(EndpointType::Generation.as_str(), "GENERATION");
        assert_eq!(EndpointType::Chat.as_str(), "CHAT");
        assert!(!EndpointType::Unrestricted.is_throttled());
        assert!(EndpointType::Chat.is_throttled());
    }
}
