//! Canonical user-agent form used for version-stable fingerprints.
//!
//! A raw UA is reduced to `family/major (os)`, e.g.
//! `Mozilla/5.0 (Windows NT 10.0; Win64; x64) ... Chrome/120.0.6099.109 Safari/537.36`
//! becomes `chrome/120 (windows)`. Patch and build numbers never reach the
//! hash, so a browser auto-update keeps the same fingerprint.
//!
//! Families are matched in table order. Order matters: Edge and Opera also
//! advertise `Chrome/`, and Chrome advertises `Safari/`.
use once_cell::sync::Lazy;

struct FamilyRule {
    family: &'static str,
    /// Token whose following version number is reported.
    tokens: &'static [&'static str],
    /// Extra substring that must also be present.
    requires: Option<&'static str>,
}

static FAMILIES: Lazy<Vec<FamilyRule>> = Lazy::new(|| {
    vec![
        FamilyRule { family: "edge", tokens: &["edg/", "edga/", "edgios/", "edge/"], requires: None },
        FamilyRule { family: "opera", tokens: &["opr/", "opera/"], requires: None },
        FamilyRule { family: "samsung", tokens: &["samsungbrowser/"], requires: None },
        FamilyRule { family: "chrome", tokens: &["chrome/", "crios/"], requires: None },
        FamilyRule { family: "firefox", tokens: &["firefox/", "fxios/"], requires: None },
        FamilyRule { family: "safari", tokens: &["version/"], requires: Some("safari") },
        FamilyRule { family: "curl", tokens: &["curl/"], requires: None },
        FamilyRule { family: "wget", tokens: &["wget/"], requires: None },
    ]
});

// Matched against whole product names, so device names like "CUBOT" pass.
const BOT_MARKERS: [&str; 3] = ["bot", "spider", "crawler"];

// (needle, os); first match wins
const OS_TABLE: [(&str, &str); 7] = [
    ("windows", "windows"),
    ("android", "android"),
    ("iphone", "ios"),
    ("ipad", "ios"),
    ("mac os x", "macos"),
    ("cros", "chromeos"),
    ("linux", "linux"),
];

pub fn canonical_user_agent(raw: &str) -> String {
    let ua = raw.trim().to_ascii_lowercase();
    if ua.is_empty() || ua == "unknown" {
        return "unknown".to_string();
    }
    let os = detect_os(&ua);

    if is_bot(&ua) {
        return format!("bot ({os})");
    }

    for rule in FAMILIES.iter() {
        if let Some(required) = rule.requires {
            if !ua.contains(required) {
                continue;
            }
        }
        for token in rule.tokens {
            if let Some(major) = major_after(&ua, token) {
                return format!("{}/{} ({})", rule.family, major, os);
            }
        }
    }

    ua
}

/// A marker counts when it is a bare word or ends a versioned product name
/// (`googlebot/2.1`, `bingbot/2.0`). Headless browsers match anywhere.
fn is_bot(ua: &str) -> bool {
    if ua.contains("headless") {
        return true;
    }
    ua.split(|c: char| c.is_whitespace() || matches!(c, ';' | '(' | ')' | ',' | '+'))
        .any(|word| {
            let (name, versioned) = match word.split_once('/') {
                Some((name, _)) => (name, true),
                None => (word, false),
            };
            BOT_MARKERS
                .iter()
                .any(|m| name == *m || (versioned && name.ends_with(m)))
        })
}

fn detect_os(ua: &str) -> &'static str {
    OS_TABLE
        .iter()
        .find(|(needle, _)| ua.contains(needle))
        .map(|(_, os)| *os)
        .unwrap_or("other")
}

fn major_after(ua: &str, token: &str) -> Option<String> {
    let start = ua.find(token)? + token.len();
    let major: String = ua[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if major.is_empty() {
        None
    } else {
        Some(major)
    }
}
