//! Safety analyzer
//!
//! Scores a candidate command for risk before it is emitted to the
//! client. The score is advisory: it rides along on the candidate and
//! never blocks emission here. Three weighted factors:
//!
//! - destructiveness (0.40): how much damage the command can do
//! - reversibility (0.35): contributes `1 - reversibility`, where 1 is
//!   trivially reversible and 0 is irreversible
//! - scope (0.25): how much of the filesystem / how much privilege it touches
//!
//! Overall risk is the weighted mean, clamped into [0, 1].

use regex::Regex;

const WEIGHT_DESTRUCTIVENESS: f64 = 0.40;
const WEIGHT_REVERSIBILITY: f64 = 0.35;
const WEIGHT_SCOPE: f64 = 0.25;

/// Per-candidate risk assessment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    pub destructiveness: f64,
    /// 1.0 = trivially reversible, 0.0 = irreversible.
    pub reversibility: f64,
    pub scope: f64,
    pub risk: f64,
}

pub struct SafetyAnalyzer {
    recursive_force_delete: Regex,
    recursive_delete: Regex,
    plain_delete: Regex,
    block_device_write: Regex,
    mkfs: Regex,
    privilege: Regex,
    shred_wipe: Regex,
    read_only: Regex,
    mutating_recoverable: Regex,
    root_scope: Regex,
    wide_glob: Regex,
}

impl SafetyAnalyzer {
    pub fn new() -> Self {
        // patterns operate on the whole command line; word boundaries keep
        // e.g. `firmware` from matching `rm`
        Self {
            recursive_force_delete: Regex::new(r"\brm\b[^|;]*(-[a-zA-Z]*r[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*r|--force[^|;]*--recursive|--recursive[^|;]*--force)").unwrap(),
            recursive_delete: Regex::new(r"\brm\b[^|;]*(-[a-zA-Z]*r|--recursive)").unwrap(),
            plain_delete: Regex::new(r"\b(rm|unlink|rmdir)\b").unwrap(),
            block_device_write: Regex::new(r"\b(dd\b[^|;]*\bof=/dev/|>\s*/dev/(sd|nvme|hd|vd))").unwrap(),
            mkfs: Regex::new(r"\b(mkfs(\.\w+)?|mkswap|fdisk|parted|wipefs)\b").unwrap(),
            privilege: Regex::new(r"\b(sudo|doas|su)\b").unwrap(),
            shred_wipe: Regex::new(r"\b(shred|wipe|blkdiscard)\b").unwrap(),
            read_only: Regex::new(r"^\s*(ls|ll|cat|less|more|head|tail|pwd|echo|printf|which|whoami|file|stat|du|df|find|grep|rg|ps|top|htop|env|printenv|date|uptime|history|man|git\s+(status|log|diff|show|branch))\b").unwrap(),
            mutating_recoverable: Regex::new(r"\b(mv|cp|chmod|chown|ln|touch|mkdir|git\s+(reset|checkout|restore|stash))\b").unwrap(),
            root_scope: Regex::new(r"(^|\s)/(\s|$)|\s/(etc|dev|boot|usr|var|bin|sbin|lib)\b").unwrap(),
            wide_glob: Regex::new(r"(^|\s)(\*|/\*|~/\*|\.\./\*)(\s|$)|\s\*\s*$").unwrap(),
        }
    }

    /// Score one candidate command.
    pub fn assess(&self, command: &str) -> RiskAssessment {
        let destructiveness = self.destructiveness(command);
        let reversibility = self.reversibility(command);
        let scope = self.scope(command);

        let risk = WEIGHT_DESTRUCTIVENESS * destructiveness
            + WEIGHT_REVERSIBILITY * (1.0 - reversibility)
            + WEIGHT_SCOPE * scope;

        RiskAssessment {
            destructiveness,
            reversibility,
            scope,
            risk: risk.clamp(0.0, 1.0),
        }
    }

    fn destructiveness(&self, command: &str) -> f64 {
        if self.block_device_write.is_match(command) || self.mkfs.is_match(command) {
            return 1.0;
        }
        if self.recursive_force_delete.is_match(command) {
            return 1.0;
        }
        if self.shred_wipe.is_match(command) {
            return 1.0;
        }
        if self.recursive_delete.is_match(command) {
            return 0.8;
        }
        if self.plain_delete.is_match(command) {
            return 0.5;
        }
        if self.privilege.is_match(command) {
            return 0.4;
        }
        0.0
    }

    fn reversibility(&self, command: &str) -> f64 {
        if self.shred_wipe.is_match(command)
            || self.block_device_write.is_match(command)
            || self.mkfs.is_match(command)
            || self.plain_delete.is_match(command)
        {
            return 0.0;
        }
        if self.read_only.is_match(command) {
            return 1.0;
        }
        if self.mutating_recoverable.is_match(command) {
            return 0.5;
        }
        // unknown commands assumed mostly recoverable
        0.8
    }

    fn scope(&self, command: &str) -> f64 {
        let mut score: f64 = 0.0;
        if self.root_scope.is_match(command) {
            score += 0.6;
        }
        if self.wide_glob.is_match(command) {
            score += 0.4;
        }
        if self.privilege.is_match(command) {
            score += 0.4;
        }
        score.min(1.0)
    }
}

impl Default for SafetyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
