//! In-call key verification
//!
//! Two peers in an active call confirm that they share the same key
//! fingerprint by reading words aloud to each other. The fingerprint is
//! rendered as a short word list; the sides alternate roles word by word, one
//! speaking and the other checking, and each confirmed or rejected word is
//! reported to the peer. Both sides finish with a verdict and exchange it;
//! the check succeeds only when both verdicts agree that every word matched.
//!
//! The session is a pure state machine: it never touches the wire. The call
//! owning it forwards the emitted messages and feeds received ones back in.

use crate::protocol::WordCheckResult;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

/// Number of fingerprint words verified per session
pub const WORD_COUNT: usize = 8;

static WORD_LISTS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    static EN: &[&str] = &[
        "acrobat", "bandit", "copper", "dragon", "eagle", "falcon", "guitar", "hammer",
        "island", "jacket", "kayak", "lantern", "magnet", "nectar", "octopus", "pencil",
        "quartz", "rocket", "saddle", "tunnel", "umbrella", "violin", "walnut", "xenon",
        "yonder", "zebra", "anchor", "bridge", "candle", "dolphin", "ember", "forest",
    ];
    static FR: &[&str] = &[
        "abricot", "balise", "cascade", "dauphin", "etoile", "fusain", "girafe", "hibou",
        "iguane", "jardin", "koala", "lavande", "moulin", "nuage", "orange", "papillon",
        "quille", "renard", "sorbet", "tulipe", "usine", "vague", "wagon", "xylophone",
        "yaourt", "zeste", "ancre", "bougie", "cerise", "dune", "eclair", "flocon",
    ];
    let mut lists: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    lists.insert("en", EN);
    lists.insert("fr", FR);
    lists
});

/// Final outcome of a key check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyCheckVerdict {
    /// The check did not complete
    #[default]
    Unknown,
    /// At least one side saw a mismatch
    No,
    /// Both sides confirmed every word
    Yes,
}

/// One word of the challenge, with the role this side plays for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordChallenge {
    /// Position of the word in the list
    pub index: i32,
    /// The word itself
    pub word: String,
    /// True when this side listens and checks; false when it speaks
    pub checker: bool,
}

/// Errors raised by driving the session out of protocol
#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyCheckError {
    /// The requested challenge locale has no word list
    #[error("Unsupported key check locale: {0}")]
    UnsupportedLocale(String),

    /// The current word is checked by the peer, not by us
    #[error("Not the checker for the current word")]
    NotChecker,

    /// The session already ran to completion
    #[error("Key check session already finished")]
    AlreadyFinished,
}

/// What the call must do after feeding the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCheckStep {
    /// Send this word result to the peer
    SendWordCheck(WordCheckResult),
    /// All words are resolved on this side; send our verdict
    SendTerminate(bool),
    /// The cursor advanced, refresh the displayed word
    WordAdvanced,
    /// The step was stale or out of order and was ignored
    Ignored,
}

/// State machine of one key check between this device and a peer
#[derive(Debug)]
pub struct KeyCheckSession {
    words: Vec<WordChallenge>,
    cursor: usize,
    all_matched: bool,
    local_verdict_sent: bool,
    peer_verdict: Option<bool>,
    local_verdict: Option<bool>,
}

impl KeyCheckSession {
    /// Build a session over the shared key fingerprint.
    ///
    /// `initiator` decides the role alternation: the initiator checks the
    /// even-indexed words, the responder the odd-indexed ones, so both sides
    /// derive identical role assignments without negotiation.
    pub fn new(initiator: bool, locale: &str, fingerprint: &[u8]) -> Result<Self, KeyCheckError> {
        let list = WORD_LISTS
            .get(locale)
            .ok_or_else(|| KeyCheckError::UnsupportedLocale(locale.to_string()))?;

        let words = (0..WORD_COUNT)
            .map(|i| {
                let byte = fingerprint.get(i % fingerprint.len().max(1)).copied().unwrap_or(0);
                WordChallenge {
                    index: i as i32,
                    word: list[byte as usize % list.len()].to_string(),
                    checker: (i % 2 == 0) == initiator,
                }
            })
            .collect();

        Ok(Self {
            words,
            cursor: 0,
            all_matched: true,
            local_verdict_sent: false,
            peer_verdict: None,
            local_verdict: None,
        })
    }

    /// Locales with a built-in word list
    pub fn supported_locales() -> Vec<&'static str> {
        let mut locales: Vec<_> = WORD_LISTS.keys().copied().collect();
        locales.sort_unstable();
        locales
    }

    /// The word currently being verified, or None once all are resolved
    pub fn current_challenge(&self) -> Option<&WordChallenge> {
        self.words.get(self.cursor)
    }

    /// True once every word is resolved on this side
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.words.len()
    }

    /// Record the user's confirmation of the current word. Only legal when
    /// this side is the checker for it.
    pub fn confirm_word(&mut self, matched: bool) -> Result<Vec<KeyCheckStep>, KeyCheckError> {
        let challenge = self
            .words
            .get(self.cursor)
            .ok_or(KeyCheckError::AlreadyFinished)?;
        if !challenge.checker {
            return Err(KeyCheckError::NotChecker);
        }

        let result = WordCheckResult {
            word_index: challenge.index,
            ok: matched,
        };
        self.all_matched &= matched;
        self.cursor += 1;

        let mut steps = vec![KeyCheckStep::SendWordCheck(result)];
        steps.extend(self.advance());
        Ok(steps)
    }

    /// Feed a word result received from the peer. Results for a word other
    /// than the current one are stale duplicates and are ignored.
    pub fn on_word_check(&mut self, result: WordCheckResult) -> Vec<KeyCheckStep> {
        let Some(challenge) = self.words.get(self.cursor) else {
            return vec![KeyCheckStep::Ignored];
        };
        if challenge.checker || challenge.index != result.word_index {
            return vec![KeyCheckStep::Ignored];
        }

        self.all_matched &= result.ok;
        self.cursor += 1;
        self.advance()
    }

    /// Feed the peer's final verdict
    pub fn on_terminate(&mut self, result: bool) {
        self.peer_verdict = Some(result);
    }

    fn advance(&mut self) -> Vec<KeyCheckStep> {
        if self.is_complete() {
            if self.local_verdict_sent {
                return Vec::new();
            }
            self.local_verdict_sent = true;
            self.local_verdict = Some(self.all_matched);
            vec![KeyCheckStep::SendTerminate(self.all_matched)]
        } else {
            vec![KeyCheckStep::WordAdvanced]
        }
    }

    /// Combined verdict. `Yes` requires both sides to have confirmed every
    /// word; any reported mismatch yields `No`; anything incomplete stays
    /// `Unknown`.
    pub fn verdict(&self) -> KeyCheckVerdict {
        match (self.local_verdict, self.peer_verdict) {
            (Some(false), _) | (_, Some(false)) => KeyCheckVerdict::No,
            (Some(true), Some(true)) => KeyCheckVerdict::Yes,
            _ => KeyCheckVerdict::Unknown,
        }
    }
}
