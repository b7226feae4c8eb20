/// Yes/no decision derived from a generated verdict.
///
/// A verdict is approved when `"yes"` appears anywhere in it, ignoring case.
/// This is intentionally loose: models rarely answer with a bare token, and
/// the pipeline has always accepted answers like `"**Yes.** The draft..."`.
/// The cost is false positives when the word shows up inside something else
/// (`"yesterday"`, `"Eyes"`, or `"NO, though yes-men might disagree"`).
pub fn approve(verdict: &str) -> bool {
    verdict.to_lowercase().contains("yes")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Approved,
    Rejected,
}

impl Verdict {
    pub fn from_text(text: &str) -> Self {
        if approve(text) {
            Self::Approved
        } else {
            Self::Rejected
        }
    }

    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "NOT APPROVED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_truth_table() {
        assert!(approve("YES, absolutely"));
        assert!(!approve("no"));
        assert!(approve("yes-or-no uncertain"));
        assert!(!approve(""));
    }

    #[test]
    fn substring_match_is_permissive() {
        assert!(approve("NO. I saw it yesterday."));
        assert!(approve("Their eyes met"));
    }

    #[test]
    fn verdict_labels() {
        assert_eq!(Verdict::from_text("Yes"), Verdict::Approved);
        assert_eq!(Verdict::from_text("NO").label(), "NOT APPROVED");
        assert!(!Verdict::Rejected.is_approved());
    }
}
