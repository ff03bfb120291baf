//! Waveform templates: named `{repeat, expand}` pairs selected by the experiment.
//!
//! `expand` tiles one sweep's worth of samples across several camera triggers within a single
//! buffer pass; `repeat` regenerates the whole pass. Ordinary stepped stacks use `Default` (1x1);
//! constant-velocity scans rewrite `CVACONPRO` so one buffer covers every frame of the scan.

use indexmap::IndexMap;
use maplit::hashmap;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct WaveformTemplate {
    pub repeat: usize,
    pub expand: usize,
}
impl Default for WaveformTemplate {
    fn default() -> Self {
        Self {
            repeat: 1,
            expand: 1,
        }
    }
}
impl WaveformTemplate {
    pub fn new(repeat: usize, expand: usize) -> Self {
        Self { repeat, expand }
    }

    /// Number of camera triggers covered by one armed buffer.
    pub fn frames(&self) -> usize {
        self.repeat * self.expand
    }
}

/// Built-in templates, in a stable order.
pub fn default_templates() -> IndexMap<String, WaveformTemplate> {
    let builtin = hashmap! {
        "Default" => WaveformTemplate::new(1, 1),
        "Confocal-Projection" => WaveformTemplate::new(5, 1),
        "Bidirectional" => WaveformTemplate::new(1, 1),
        "CVACONPRO" => WaveformTemplate::new(1, 1),
    };
    let mut templates: IndexMap<String, WaveformTemplate> = builtin
        .into_iter()
        .map(|(name, template)| (name.to_string(), template))
        .collect();
    templates.sort_keys();
    templates
}

/// Resolves a template by name, rejecting unknown names and degenerate factors.
pub fn lookup_template(
    templates: &IndexMap<String, WaveformTemplate>,
    name: &str,
) -> Result<WaveformTemplate> {
    let template = *templates
        .get(name)
        .ok_or_else(|| ConfigError::UnknownTemplate(name.to_string()))?;
    if template.repeat == 0 || template.expand == 0 {
        return Err(ConfigError::EmptyTemplate {
            name: name.to_string(),
            repeat: template.repeat,
            expand: template.expand,
        });
    }
    Ok(template)
}

#[cfg(test)]
mod test {
    use crate::template::*;

    #[test]
    fn builtin_lookup() {
        let templates = default_templates();
        assert_eq!(lookup_template(&templates, "Default"), Ok(WaveformTemplate::new(1, 1)));
        assert_eq!(
            lookup_template(&templates, "Confocal-Projection").unwrap().frames(),
            5
        );
        assert_eq!(
            lookup_template(&templates, "Zigzag"),
            Err(ConfigError::UnknownTemplate("Zigzag".to_string()))
        );
    }

    #[test]
    fn zero_factor_is_rejected() {
        let mut templates = default_templates();
        templates.insert("Broken".to_string(), WaveformTemplate::new(0, 4));
        assert!(matches!(
            lookup_template(&templates, "Broken"),
            Err(ConfigError::EmptyTemplate { .. })
        ));
    }
}
