//! Local assets injected into rendered documents.
//!
//! Fonts are served over loopback by the asset server; small images are
//! inlined as data URIs so documents never depend on remote fetches.

use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value;
use tracing::warn;
use url::Url;

use super::document::DocumentContext;

const SOURCE: &str = "application::render::assets";

/// Context key holding the URL of the local font stylesheet.
pub const FONT_CSS_URL_KEY: &str = "font_css_url";
/// Context key holding the inlined footer texture.
pub const FOOTER_KEY: &str = "footer_b64";
/// Context key holding the inlined logo.
pub const LOGO_KEY: &str = "logo_b64";
pub const LOGO_FILE_NAME: &str = "kurobbs.png";

/// Which footer texture to prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FooterVariant {
    Black,
    White,
}

impl FooterVariant {
    fn file_name(self) -> &'static str {
        match self {
            FooterVariant::Black => "footer_black.png",
            FooterVariant::White => "footer_white.png",
        }
    }

    fn opposite(self) -> Self {
        match self {
            FooterVariant::Black => FooterVariant::White,
            FooterVariant::White => FooterVariant::Black,
        }
    }
}

/// Where the asset server lives and what it serves.
#[derive(Debug, Clone)]
pub struct AssetLocator {
    base_url: String,
    fonts_dir: PathBuf,
    mount_path: String,
    stylesheet: String,
    texture_dir: Option<PathBuf>,
    footer: FooterVariant,
}

impl AssetLocator {
    pub fn new(
        base_url: impl Into<String>,
        fonts_dir: impl Into<PathBuf>,
        mount_path: impl Into<String>,
        stylesheet: impl Into<String>,
    ) -> Self {
        let mount_path = mount_path.into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fonts_dir: fonts_dir.into(),
            mount_path: format!("/{}", mount_path.trim_matches('/')),
            stylesheet: stylesheet.into(),
            texture_dir: None,
            footer: FooterVariant::Black,
        }
    }

    /// Directory holding the footer textures and the logo.
    pub fn with_texture_dir(mut self, texture_dir: impl Into<PathBuf>) -> Self {
        self.texture_dir = Some(texture_dir.into());
        self
    }

    pub fn with_footer(mut self, footer: FooterVariant) -> Self {
        self.footer = footer;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the font stylesheet, or `None` when the file is not on disk.
    pub fn font_css_url(&self) -> Option<String> {
        if !self.fonts_dir.join(&self.stylesheet).is_file() {
            return None;
        }
        Some(format!(
            "{}{}/{}",
            self.base_url, self.mount_path, self.stylesheet
        ))
    }

    /// Insert `font_css_url`, `footer_b64` and `logo_b64`, keeping any value
    /// the caller already provided.
    pub fn inject(&self, context: &mut DocumentContext) {
        self.inject_font_css(context);

        let Some(texture_dir) = self.texture_dir.as_deref() else {
            return;
        };
        if !context.contains_key(FOOTER_KEY)
            && let Some(uri) = footer_data_uri(texture_dir, self.footer)
        {
            context.insert(FOOTER_KEY.to_string(), Value::String(uri));
        }
        if !context.contains_key(LOGO_KEY)
            && let Some(uri) = logo_data_uri(texture_dir)
        {
            context.insert(LOGO_KEY.to_string(), Value::String(uri));
        }
    }

    fn inject_font_css(&self, context: &mut DocumentContext) {
        if context.contains_key(FONT_CSS_URL_KEY) {
            return;
        }
        match self.font_css_url() {
            Some(url) => {
                context.insert(FONT_CSS_URL_KEY.to_string(), Value::String(url));
            }
            None => warn!(
                target = SOURCE,
                op = "assets::inject",
                result = "missing",
                path = %self.fonts_dir.join(&self.stylesheet).display(),
                "Font stylesheet not found; keeping original font links"
            ),
        }
    }
}

/// Loopback URL of a server bound to `host:port`.
///
/// Wildcard and empty hosts are unreachable as a destination, so they map to
/// `127.0.0.1`.
pub fn local_base_url(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = if host.is_empty() || host == "0.0.0.0" {
        "127.0.0.1"
    } else {
        host
    };

    let candidate = format!("http://{host}:{port}");
    match Url::parse(&candidate) {
        Ok(url) => url.as_str().trim_end_matches('/').to_string(),
        Err(err) => {
            warn!(
                target = SOURCE,
                op = "assets::local_base_url",
                host,
                error = %err,
                "Unparseable asset host; falling back to loopback"
            );
            format!("http://127.0.0.1:{port}")
        }
    }
}

/// Inline a local image as `data:image/<ext>;base64,...`.
///
/// Returns an empty string when the file is missing or unreadable.
pub fn image_data_uri(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(bytes) => encode_data_uri(path, &bytes),
        Err(err) => {
            warn!(
                target = SOURCE,
                op = "assets::image_data_uri",
                path = %path.display(),
                error = %err,
                "Failed to inline image"
            );
            String::new()
        }
    }
}

/// Footer texture for the requested variant, falling back to the other one.
pub fn footer_data_uri(texture_dir: impl AsRef<Path>, variant: FooterVariant) -> Option<String> {
    let texture_dir = texture_dir.as_ref();
    [variant, variant.opposite()]
        .into_iter()
        .map(|candidate| texture_dir.join(candidate.file_name()))
        .find(|path| path.is_file())
        .map(image_data_uri)
        .filter(|uri| !uri.is_empty())
}

pub fn logo_data_uri(dir: impl AsRef<Path>) -> Option<String> {
    let path = dir.as_ref().join(LOGO_FILE_NAME);
    if !path.is_file() {
        return None;
    }
    Some(image_data_uri(path)).filter(|uri| !uri.is_empty())
}

fn encode_data_uri(path: &Path, bytes: &[u8]) -> String {
    let mime = mime_guess::from_path(path)
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .map(|mime| mime.subtype().to_string())
        .or_else(|| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| match ext.to_ascii_lowercase().as_str() {
                    "jpg" => "jpeg".to_string(),
                    other => other.to_string(),
                })
        })
        .unwrap_or_else(|| "png".to_string());
    format!("data:image/{mime};base64,{}", STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_host_maps_to_loopback() {
        assert_eq!(local_base_url("0.0.0.0", 8765), "http://127.0.0.1:8765");
        assert_eq!(local_base_url("", 8080), "http://127.0.0.1:8080");
        assert_eq!(local_base_url("localhost", 9000), "http://localhost:9000");
    }

    #[test]
    fn font_css_url_requires_stylesheet_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locator = AssetLocator::new(
            "http://127.0.0.1:8765/",
            dir.path(),
            "waves/fonts/",
            "fonts.css",
        );
        assert_eq!(locator.font_css_url(), None);

        fs::write(dir.path().join("fonts.css"), "@font-face {}").expect("write");
        assert_eq!(
            locator.font_css_url().as_deref(),
            Some("http://127.0.0.1:8765/waves/fonts/fonts.css")
        );
    }

    #[test]
    fn inject_keeps_caller_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("fonts.css"), "").expect("write");
        let locator = AssetLocator::new("http://127.0.0.1:1", dir.path(), "/f", "fonts.css");

        let mut context = DocumentContext::new();
        context.insert(FONT_CSS_URL_KEY.into(), Value::String("custom".into()));
        locator.inject(&mut context);
        assert_eq!(context[FONT_CSS_URL_KEY], "custom");

        let mut empty = DocumentContext::new();
        locator.inject(&mut empty);
        assert_eq!(empty[FONT_CSS_URL_KEY], "http://127.0.0.1:1/f/fonts.css");
    }

    #[test]
    fn inject_without_stylesheet_leaves_context_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let locator = AssetLocator::new("http://127.0.0.1:1", dir.path(), "/f", "fonts.css");
        let mut context = DocumentContext::new();
        locator.inject(&mut context);
        assert!(context.is_empty());
    }

    #[test]
    fn inject_inlines_footer_and_logo_from_texture_dir() {
        let fonts = tempfile::tempdir().expect("tempdir");
        let textures = tempfile::tempdir().expect("tempdir");
        fs::write(textures.path().join("footer_white.png"), [0u8]).expect("write");
        fs::write(textures.path().join(LOGO_FILE_NAME), [0u8, 1]).expect("write");
        let locator = AssetLocator::new("http://127.0.0.1:1", fonts.path(), "/f", "fonts.css")
            .with_texture_dir(textures.path());

        let mut context = DocumentContext::new();
        context.insert(LOGO_KEY.into(), Value::String("mine".into()));
        locator.inject(&mut context);

        assert_eq!(context[FOOTER_KEY], "data:image/png;base64,AA==");
        assert_eq!(context[LOGO_KEY], "mine");
    }

    #[test]
    fn inject_without_texture_dir_skips_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("footer_black.png"), [0u8]).expect("write");
        let locator = AssetLocator::new("http://127.0.0.1:1", dir.path(), "/f", "fonts.css");
        let mut context = DocumentContext::new();
        locator.inject(&mut context);
        assert!(!context.contains_key(FOOTER_KEY));
        assert!(!context.contains_key(LOGO_KEY));
    }

    #[test]
    fn jpg_images_use_jpeg_mime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("avatar.jpg");
        fs::write(&path, [1u8, 2, 3]).expect("write");
        assert_eq!(image_data_uri(&path), "data:image/jpeg;base64,AQID");
    }

    #[test]
    fn missing_image_yields_empty_string() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(image_data_uri(dir.path().join("nope.png")), "");
    }

    #[test]
    fn footer_falls_back_to_other_variant() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(footer_data_uri(dir.path(), FooterVariant::Black), None);

        fs::write(dir.path().join("footer_white.png"), [0u8]).expect("write");
        let uri = footer_data_uri(dir.path(), FooterVariant::Black).expect("fallback");
        assert!(uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn logo_is_optional() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(logo_data_uri(dir.path()), None);
        fs::write(dir.path().join(LOGO_FILE_NAME), [0u8, 1]).expect("write");
        assert_eq!(
            logo_data_uri(dir.path()).as_deref(),
            Some("data:image/png;base64,AAE=")
        );
    }
}
