// Operator upgraders
//
// An operator whose behavior changed at archive version V is recorded with
// the version that introduced the change. Loading an archive written before
// V swaps the operator for one that keeps the old behavior.

/// One historical-behavior replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upgrader {
    /// Qualified operator name as written by older archives.
    pub op: &'static str,
    /// First archive version with the current behavior.
    pub introduced: u64,
    /// Operator that reproduces the old behavior.
    pub replacement: &'static str,
}

/// Tensor `div` rounded toward negative infinity on integral inputs before
/// version 4; it is true division since.
pub const UPGRADERS: &[Upgrader] = &[
    Upgrader {
        op: "div.Tensor",
        introduced: 4,
        replacement: "_div_legacy.Tensor",
    },
    Upgrader {
        op: "div.Scalar",
        introduced: 4,
        replacement: "_div_legacy.Scalar",
    },
];

/// Operator to use for `op` in an archive of `version`.
pub fn upgrade(op: &str, version: u64) -> &str {
    UPGRADERS
        .iter()
        .find(|u| u.op == op && version < u.introduced)
        .map(|u| u.replacement)
        .unwrap_or(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_div_upgraded_only_for_old_archives() {
        assert_eq!(upgrade("div.Tensor", 3), "_div_legacy.Tensor");
        assert_eq!(upgrade("div.Scalar", 0), "_div_legacy.Scalar");
        assert_eq!(upgrade("div.Tensor", 4), "div.Tensor");
        assert_eq!(upgrade("div.int", 1), "div.int");
        assert_eq!(upgrade("add.Tensor", 1), "add.Tensor");
    }
}
