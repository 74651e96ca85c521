//! Naming conventions shared with field configuration.
//!
//! Every PV has four companion limit PVs, formed by appending a fixed pair of
//! field suffixes to the base name:
//!
//! | Limit       | Lower   | Upper   |
//! |-------------|---------|---------|
//! | Operation   | `.LOPR` | `.HOPR` |
//! | Warning     | `.LOW`  | `.HIGH` |
//! | Alarm       | `.LOLO` | `.HIHI` |
//! | Drive       | `.DRVL` | `.DRVH` |

/// Buffer length given to waveform-shaped signals
pub const DEFAULT_ARRAY_SIZE: usize = 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Operation,
    Warning,
    Alarm,
    Drive,
}

impl LimitKind {
    pub const ALL: [LimitKind; 4] = [
        LimitKind::Operation,
        LimitKind::Warning,
        LimitKind::Alarm,
        LimitKind::Drive,
    ];

    /// The (lower, upper) field suffixes
    pub const fn suffixes(&self) -> (&'static str, &'static str) {
        match self {
            LimitKind::Operation => (".LOPR", ".HOPR"),
            LimitKind::Warning => (".LOW", ".HIGH"),
            LimitKind::Alarm => (".LOLO", ".HIHI"),
            LimitKind::Drive => (".DRVL", ".DRVH"),
        }
    }
}

/// The lower and upper limit PV names for `base`
pub fn limit_pvs(base: &str, kind: LimitKind) -> [String; 2] {
    let (lower, upper) = kind.suffixes();
    [format!("{base}{lower}"), format!("{base}{upper}")]
}

/// Does this signal hold a waveform (turn-by-turn or amplitude array)?
pub fn is_waveform_signal(signal: &str) -> bool {
    signal.ends_with("TBT") || signal.ends_with('A')
}

/// Number of elements to provision for a signal
pub fn signal_size(signal: &str) -> usize {
    if is_waveform_signal(signal) {
        DEFAULT_ARRAY_SIZE
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_suffixes() {
        assert_eq!(
            limit_pvs("Magnet1:I", LimitKind::Warning),
            ["Magnet1:I.LOW", "Magnet1:I.HIGH"]
        );
        assert_eq!(
            limit_pvs("Magnet1:I", LimitKind::Operation),
            ["Magnet1:I.LOPR", "Magnet1:I.HOPR"]
        );
        assert_eq!(
            limit_pvs("Magnet1:I", LimitKind::Alarm),
            ["Magnet1:I.LOLO", "Magnet1:I.HIHI"]
        );
        assert_eq!(
            limit_pvs("Magnet1:I", LimitKind::Drive),
            ["Magnet1:I.DRVL", "Magnet1:I.DRVH"]
        );
    }

    #[test]
    fn waveform_sizes() {
        assert_eq!(signal_size("BPM01:xTBT"), DEFAULT_ARRAY_SIZE);
        assert_eq!(signal_size("BPM01:amplitudeA"), DEFAULT_ARRAY_SIZE);
        assert_eq!(signal_size("BPM01:xAvg"), 1);
        assert_eq!(signal_size("Magnet1:B"), 1);
        assert!(!is_waveform_signal("TBT:x"));
    }
}
