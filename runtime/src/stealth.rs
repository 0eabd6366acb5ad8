//! Fingerprint profiles — coherent browser identities plus the interaction
//! pacing that goes with them.
//!
//! A profile bundles every identity knob (UA, screen, webgl vendor and
//! renderer, language, timezone) so one session presents a single
//! consistent machine. Pacing ranges live on the profile too: a 1080p
//! desktop Chrome scrolls differently from an older notebook, and mixing
//! identities per step is itself a detection signal.

use crate::browser::{InteractionScript, InteractionStep};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One coherent browser identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintProfile {
    pub name: String,
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub language: String,
    pub languages: Vec<String>,
    pub timezone: String,
    /// Scroll step count range per interaction.
    pub scroll_steps: (u32, u32),
    /// Pause range between scroll steps, milliseconds.
    pub scroll_pause_ms: (u64, u64),
    /// Hover dwell range, milliseconds.
    pub hover_dwell_ms: (u64, u64),
    /// Initial settle dwell range after readiness, milliseconds.
    pub initial_dwell_ms: (u64, u64),
}

impl FingerprintProfile {
    /// Build a randomized interaction script paced by this profile.
    /// Scroll depth converges around 80% of the page, which is where the
    /// monitored sites mount their lazy price blocks.
    pub fn interaction_script<R: Rng>(&self, rng: &mut R) -> InteractionScript {
        let mut steps = Vec::new();

        steps.push(InteractionStep::Dwell {
            ms: rng.gen_range(self.initial_dwell_ms.0..=self.initial_dwell_ms.1),
        });

        let scroll_count = rng.gen_range(self.scroll_steps.0..=self.scroll_steps.1);
        for i in 0..scroll_count {
            let progress = (i + 1) as f64 / scroll_count as f64;
            let to_fraction = (progress * rng.gen_range(0.7..0.85)).min(0.85);
            steps.push(InteractionStep::Scroll {
                to_fraction,
                pause_ms: rng.gen_range(self.scroll_pause_ms.0..=self.scroll_pause_ms.1),
            });
        }

        // Hover price-candidate elements; several sites reveal pix/installment
        // panels only on hover.
        for selector in ["[class*='price']", "[class*='pix']", "[data-price]"] {
            if rng.gen_bool(0.7) {
                steps.push(InteractionStep::Hover {
                    selector: selector.to_string(),
                    dwell_ms: rng.gen_range(self.hover_dwell_ms.0..=self.hover_dwell_ms.1),
                });
            }
        }

        InteractionScript { steps }
    }
}

/// Built-in desktop profiles. All pt-BR with São Paulo geography — the
/// monitored marketplaces treat foreign locales as a risk signal.
pub fn builtin_profiles() -> &'static [FingerprintProfile] {
    use std::sync::OnceLock;
    static PROFILES: OnceLock<Vec<FingerprintProfile>> = OnceLock::new();
    PROFILES.get_or_init(|| {
        vec![
            FingerprintProfile {
                name: "win10-chrome".into(),
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                    .into(),
                viewport: (1920, 1080),
                webgl_vendor: "Google Inc. (NVIDIA)".into(),
                webgl_renderer:
                    "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0)".into(),
                language: "pt-BR".into(),
                languages: vec!["pt-BR".into(), "pt".into(), "en-US".into(), "en".into()],
                timezone: "America/Sao_Paulo".into(),
                scroll_steps: (3, 6),
                scroll_pause_ms: (500, 2000),
                hover_dwell_ms: (300, 1000),
                initial_dwell_ms: (1000, 3000),
            },
            FingerprintProfile {
                name: "win11-edge".into(),
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0"
                    .into(),
                viewport: (1536, 864),
                webgl_vendor: "Google Inc. (Intel)".into(),
                webgl_renderer:
                    "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0)".into(),
                language: "pt-BR".into(),
                languages: vec!["pt-BR".into(), "pt".into(), "en".into()],
                timezone: "America/Sao_Paulo".into(),
                scroll_steps: (3, 5),
                scroll_pause_ms: (700, 2500),
                hover_dwell_ms: (400, 1200),
                initial_dwell_ms: (1500, 3500),
            },
            FingerprintProfile {
                name: "macos-chrome".into(),
                user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                    .into(),
                viewport: (1440, 900),
                webgl_vendor: "Google Inc. (Apple)".into(),
                webgl_renderer: "ANGLE (Apple, Apple M2, OpenGL 4.1)".into(),
                language: "pt-BR".into(),
                languages: vec!["pt-BR".into(), "en-US".into()],
                timezone: "America/Sao_Paulo".into(),
                scroll_steps: (4, 7),
                scroll_pause_ms: (400, 1800),
                hover_dwell_ms: (250, 900),
                initial_dwell_ms: (800, 2500),
            },
        ]
    })
}

/// Pick a profile for a domain, honoring a preferred subset when present.
/// Unknown preferences fall back to the full built-in set.
pub fn pick_for_domain<'a, R: Rng>(
    rng: &mut R,
    preferred: &[String],
    profiles: &'a [FingerprintProfile],
) -> &'a FingerprintProfile {
    if !preferred.is_empty() {
        let subset: Vec<&FingerprintProfile> = profiles
            .iter()
            .filter(|p| preferred.iter().any(|n| n == &p.name))
            .collect();
        if let Some(p) = subset.choose(rng) {
            return p;
        }
    }
    profiles.choose(rng).expect("profile set is non-empty")
}
