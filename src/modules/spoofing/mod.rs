//! Browser fingerprint presets and header templating.
//!
//! Fingerprints are immutable presets drawn from a fixed catalog. Header
//! values are data, not code: a [`HeaderTemplate`] is an ordered table of
//! header names and value patterns rendered against a fingerprint.

use http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::modules::rng::SharedRng;

/// Client presentation attributes for one simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub id: String,
    pub user_agent: String,
    pub platform: String,
    pub mobile: bool,
    pub locale: String,
    pub timezone: String,
    pub screen_resolution: (u16, u16),
    pub color_depth: u8,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    #[serde(default)]
    pub plugins: Vec<String>,
    pub canvas_noise: f32,
}

impl Fingerprint {
    /// Primary language subtag, e.g. `en` for `en-US`.
    pub fn language_short(&self) -> &str {
        self.locale.split('-').next().unwrap_or(&self.locale)
    }

    /// App client platform matching the device family.
    pub fn client_platform(&self) -> &'static str {
        let platform = self.platform.to_ascii_lowercase();
        if platform.contains("android") {
            "Android"
        } else if ["iphone", "ipad", "ios"].iter().any(|p| platform.contains(p)) {
            "iOS"
        } else {
            "Web"
        }
    }
}

static DEFAULT_FINGERPRINTS: Lazy<Vec<Arc<Fingerprint>>> = Lazy::new(|| {
    vec![
        Arc::new(Fingerprint {
            id: "win-chrome-nvidia".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36".into(),
            platform: "Windows".into(),
            mobile: false,
            locale: "en-US".into(),
            timezone: "America/New_York".into(),
            screen_resolution: (1920, 1080),
            color_depth: 24,
            webgl_vendor: "Google Inc. (NVIDIA)".into(),
            webgl_renderer: "ANGLE (NVIDIA, NVIDIA GeForce RTX 3080 Direct3D11 vs_5_0 ps_5_0)".into(),
            plugins: vec![
                "PDF Viewer".into(),
                "Chrome PDF Viewer".into(),
                "Chromium PDF Viewer".into(),
                "Native Client".into(),
            ],
            canvas_noise: 0.1,
        }),
        Arc::new(Fingerprint {
            id: "iphone-safari".into(),
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1".into(),
            platform: "iPhone".into(),
            mobile: true,
            locale: "en-US".into(),
            timezone: "America/Los_Angeles".into(),
            screen_resolution: (1170, 2532),
            color_depth: 32,
            webgl_vendor: "Apple GPU".into(),
            webgl_renderer: "Apple GPU".into(),
            plugins: Vec::new(),
            canvas_noise: 0.05,
        }),
        Arc::new(Fingerprint {
            id: "mac-chrome-m1".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36".into(),
            platform: "Macintosh".into(),
            mobile: false,
            locale: "en-GB".into(),
            timezone: "Europe/London".into(),
            screen_resolution: (2560, 1600),
            color_depth: 30,
            webgl_vendor: "Apple GPU".into(),
            webgl_renderer: "Apple M1 Pro".into(),
            plugins: vec![
                "PDF Viewer".into(),
                "Chrome PDF Viewer".into(),
                "Chromium PDF Viewer".into(),
            ],
            canvas_noise: 0.08,
        }),
        Arc::new(Fingerprint {
            id: "win-firefox-intel".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0".into(),
            platform: "Windows".into(),
            mobile: false,
            locale: "de-DE".into(),
            timezone: "Europe/Berlin".into(),
            screen_resolution: (1680, 1050),
            color_depth: 24,
            webgl_vendor: "Mozilla".into(),
            webgl_renderer: "ANGLE (Intel(R) UHD Graphics 630)".into(),
            plugins: vec!["PDF Viewer".into()],
            canvas_noise: 0.12,
        }),
        Arc::new(Fingerprint {
            id: "android-chrome-pixel".into(),
            user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 7 Pro) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Mobile Safari/537.36".into(),
            platform: "Android".into(),
            mobile: true,
            locale: "es-ES".into(),
            timezone: "Europe/Madrid".into(),
            screen_resolution: (1080, 2400),
            color_depth: 24,
            webgl_vendor: "Qualcomm".into(),
            webgl_renderer: "Adreno (TM) 730".into(),
            plugins: Vec::new(),
            canvas_noise: 0.07,
        }),
    ]
});

#[derive(Debug, Error)]
pub enum SpoofingError {
    #[error("fingerprint catalog is empty")]
    EmptyCatalog,
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    #[error("invalid value for header '{0}'")]
    InvalidHeaderValue(String),
}

/// Fixed catalog of fingerprint presets.
#[derive(Debug)]
pub struct FingerprintCatalog {
    presets: Vec<Arc<Fingerprint>>,
    rng: SharedRng,
    last: Mutex<Option<usize>>,
}

impl FingerprintCatalog {
    pub fn new(presets: Vec<Fingerprint>, rng: SharedRng) -> Result<Self, SpoofingError> {
        if presets.is_empty() {
            return Err(SpoofingError::EmptyCatalog);
        }
        Ok(Self {
            presets: presets.into_iter().map(Arc::new).collect(),
            rng,
            last: Mutex::new(None),
        })
    }

    /// The built-in desktop/mobile preset table.
    pub fn builtin(rng: SharedRng) -> Self {
        Self {
            presets: DEFAULT_FINGERPRINTS.clone(),
            rng,
            last: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Uniform draw, skipping the preset returned last time when possible.
    pub fn draw(&self) -> Arc<Fingerprint> {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let index = self.rng.index_avoiding(self.presets.len(), *last);
        *last = Some(index);
        self.presets[index].clone()
    }
}

/// Per-render inputs that are not part of the fingerprint.
#[derive(Debug, Clone, Default)]
pub struct RenderContext<'a> {
    pub cookie_header: Option<&'a str>,
}

/// Ordered header name → value pattern table.
///
/// Patterns may contain `{user_agent}`, `{language}`, `{language_short}`,
/// `{platform}`, `{mobile}`, `{client_platform}`, `{timezone}`,
/// `{random_ip}`, `{token}`, `{uuid}`, `{rand:LO-HI}`, and `{cookie}`.
/// Headers whose rendered value is empty are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderTemplate {
    pub entries: Vec<(String, String)>,
}

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(?P<name>[a-z_]+)(?::(?P<lo>\d+)-(?P<hi>\d+))?\}")
        .expect("invalid placeholder regex")
});

static DEFAULT_TEMPLATE: Lazy<HeaderTemplate> = Lazy::new(|| {
    let entries: &[(&str, &str)] = &[
        ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8"),
        ("Accept-Encoding", "gzip, br"),
        ("Accept-Language", "{language},{language_short};q=0.9"),
        ("Cache-Control", "no-cache"),
        ("Pragma", "no-cache"),
        ("Sec-Ch-Ua-Mobile", "{mobile}"),
        ("Sec-Ch-Ua-Platform", "\"{platform}\""),
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-Site", "none"),
        ("Sec-Fetch-User", "?1"),
        ("Upgrade-Insecure-Requests", "1"),
        ("User-Agent", "{user_agent}"),
        ("Cookie", "{cookie}"),
        ("X-Requested-With", "XMLHttpRequest"),
        ("X-IG-App-ID", "936619743392459"),
        ("X-IG-WWW-Claim", "0"),
        ("X-ASBD-ID", "198387"),
        ("X-Forwarded-For", "{random_ip}"),
        ("X-IG-Connection-Type", "WIFI"),
        ("X-IG-Bandwidth-Speed-KBPS", "{rand:1000-2000}"),
        ("X-IG-App-Locale", "{language_short}"),
        ("X-IG-Device-Locale", "{language}"),
        ("X-IG-Device-ID", "{uuid}"),
        ("X-Pigeon-Session-Id", "{token}"),
        ("X-IG-Client-Platform", "{client_platform}"),
        ("X-IG-Timezone", "{timezone}"),
    ];
    HeaderTemplate {
        entries: entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    }
});

impl HeaderTemplate {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    /// Browser/app header set used when no template is configured.
    pub fn builtin() -> Self {
        DEFAULT_TEMPLATE.clone()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn render(
        &self,
        fingerprint: &Fingerprint,
        context: &RenderContext<'_>,
        rng: &SharedRng,
    ) -> Result<HeaderMap, SpoofingError> {
        let mut headers = HeaderMap::with_capacity(self.entries.len());
        for (name, pattern) in &self.entries {
            let value = render_pattern(pattern, fingerprint, context, rng);
            if value.is_empty() {
                continue;
            }
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| SpoofingError::InvalidHeaderName(name.clone()))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|_| SpoofingError::InvalidHeaderValue(name.clone()))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}

impl Default for HeaderTemplate {
    fn default() -> Self {
        Self::builtin()
    }
}

fn render_pattern(
    pattern: &str,
    fingerprint: &Fingerprint,
    context: &RenderContext<'_>,
    rng: &SharedRng,
) -> String {
    PLACEHOLDER_RE
        .replace_all(pattern, |caps: &regex::Captures<'_>| {
            match &caps["name"] {
                "user_agent" => fingerprint.user_agent.clone(),
                "language" => fingerprint.locale.clone(),
                "language_short" => fingerprint.language_short().to_string(),
                "platform" => fingerprint.platform.clone(),
                "mobile" => (if fingerprint.mobile { "?1" } else { "?0" }).to_string(),
                "client_platform" => fingerprint.client_platform().to_string(),
                "timezone" => fingerprint.timezone.clone(),
                "random_ip" => random_ip(rng),
                "token" => rng.token(13),
                "uuid" => rng.uuid_v4(),
                "cookie" => context.cookie_header.unwrap_or_default().to_string(),
                "rand" => {
                    let lo = caps.name("lo").and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                    let hi = caps.name("hi").and_then(|m| m.as_str().parse().ok()).unwrap_or(lo);
                    rng.range_u64(lo, hi).to_string()
                }
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn random_ip(rng: &SharedRng) -> String {
    (0..4)
        .map(|_| rng.range_u64(1, 254).to_string())
        .collect::<Vec<_>>()
        .join(".")
}

const AUTOMATION_MARKERS: [&str; 4] = ["bot", "crawler", "spider", "scraper"];

/// True when the user agent carries two or more automation markers.
pub fn looks_automated(headers: &HeaderMap) -> bool {
    let Some(agent) = headers
        .get(http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let agent = agent.to_ascii_lowercase();
    AUTOMATION_MARKERS
        .iter()
        .filter(|marker| agent.contains(*marker))
        .count()
        >= 2
}
