//! Languages without a tracing runtime run unmodified

use super::{InstrumentationConfig, SourceUnit, Weaver, WovenUnit};

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainWeaver;

impl Weaver for PlainWeaver {
    fn weave(&self, unit: &SourceUnit, config: &InstrumentationConfig) -> WovenUnit {
        let mut woven = WovenUnit::new(unit.program().to_string());
        if config.records_anything() {
            woven
                .warnings
                .push("no instrumentation available for this language, behavior is not traced".to_string());
        }
        woven
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let unit = SourceUnit::Code("echo hi\n".into());
        let woven = PlainWeaver.weave(&unit, &InstrumentationConfig::default());
        assert_eq!(woven.source, "echo hi\n");
        assert!(woven.warnings.is_empty());

        let woven = PlainWeaver.weave(&unit, &InstrumentationConfig::all());
        assert_eq!(woven.warnings.len(), 1);
    }
}
