//! Per-step candidate distributions.

use serde::{Deserialize, Serialize};

/// Engine token identifier.
pub type TokenId = u32;

/// One possible next token proposed by the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: TokenId,
    pub logit: f32,
    pub probability: f32,
}

/// The distribution produced at one generation step and the token chosen from it.
///
/// Candidates keep the order the engine reported them in; nothing here
/// re-sorts by probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    selected: usize,
    candidates: Vec<Candidate>,
    text: String,
}

impl CandidateSet {
    /// Builds the set for a sampled token.
    ///
    /// When the engine's distribution does not contain the sampled token it is
    /// appended with `-inf` logit and zero probability, so the selection is
    /// always addressable.
    pub fn from_sample(token: TokenId, mut candidates: Vec<Candidate>, text: String) -> Self {
        let selected = if let Some(pos) = candidates.iter().position(|c| c.id == token) {
            pos
        } else {
            candidates.push(Candidate {
                id: token,
                logit: f32::NEG_INFINITY,
                probability: 0.0,
            });
            candidates.len() - 1
        };
        Self {
            selected,
            candidates,
            text,
        }
    }

    /// Returns a copy of this set with another candidate selected.
    ///
    /// Returns `None` if `index` is out of range.
    pub fn with_selection(&self, index: usize, text: impl Into<String>) -> Option<Self> {
        (index < self.candidates.len()).then(|| Self {
            selected: index,
            candidates: self.candidates.clone(),
            text: text.into(),
        })
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected(&self) -> &Candidate {
        &self.candidates[self.selected]
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn get(&self, index: usize) -> Option<&Candidate> {
        self.candidates.get(index)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Decoded text of the selected token.
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: TokenId, logit: f32, probability: f32) -> Candidate {
        Candidate {
            id,
            logit,
            probability,
        }
    }

    #[test]
    fn test_from_sample_selects_position_in_engine_order() {
        let set = CandidateSet::from_sample(
            7,
            vec![candidate(3, 0.5, 0.2), candidate(7, 1.5, 0.7), candidate(9, 0.1, 0.1)],
            " cat".to_string(),
        );
        assert_eq!(set.selected_index(), 1);
        assert_eq!(set.selected().id, 7);
        assert_eq!(set.text(), " cat");
        // engine order untouched
        assert_eq!(set.candidates()[0].id, 3);
    }

    #[test]
    fn test_from_sample_appends_missing_token() {
        let set = CandidateSet::from_sample(42, vec![candidate(1, 2.0, 0.9)], "x".to_string());
        assert_eq!(set.len(), 2);
        assert_eq!(set.selected_index(), 1);
        assert_eq!(set.selected().id, 42);
        assert!(set.selected().logit.is_infinite());
        assert!(set.selected().probability.abs() < f32::EPSILON);
    }

    #[test]
    fn test_with_selection() {
        let set = CandidateSet::from_sample(
            1,
            vec![candidate(1, 2.0, 0.8), candidate(2, 1.0, 0.2)],
            "a".to_string(),
        );
        let alt = set.with_selection(1, "b").unwrap();
        assert_eq!(alt.selected().id, 2);
        assert_eq!(alt.text(), "b");
        assert_eq!(alt.candidates(), set.candidates());

        assert!(set.with_selection(2, "c").is_none());
    }
}
