use serde::Deserialize;

use crate::{
    error::Result,
    model::{
        db::{Candidate, CandidateId},
        store::DynStore,
    },
};

/// A position and its candidates, as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PositionSpec {
    pub name: String,
    pub candidates: Vec<CandidateSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CandidateSpec {
    pub id: CandidateId,
    pub name: String,
}

/// The contested positions and their candidates, in listing order.
/// Loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    positions: Vec<String>,
    candidates: Vec<Candidate>,
}

impl Roster {
    /// Build a roster from configured positions. Positions without candidates are skipped.
    pub fn from_specs(specs: &[PositionSpec]) -> Self {
        let candidates = specs
            .iter()
            .flat_map(|position| {
                position.candidates.iter().map(move |candidate| (position, candidate))
            })
            .zip(0..)
            .map(|((position, candidate), order)| Candidate {
                id: candidate.id.clone(),
                name: candidate.name.clone(),
                position: position.name.clone(),
                order,
            })
            .collect();
        Self::from_candidates(candidates)
    }

    /// Build a roster from seeded candidates. Positions are listed in the
    /// order their first candidate appears.
    pub fn from_candidates(mut candidates: Vec<Candidate>) -> Self {
        candidates.sort_by_key(|c| c.order);
        let mut positions: Vec<String> = Vec::new();
        for candidate in &candidates {
            if !positions.contains(&candidate.position) {
                positions.push(candidate.position.clone());
            }
        }
        Self {
            positions,
            candidates,
        }
    }

    /// Use the configured roster if there is one, else the store's `candidates` collection.
    pub async fn load(configured: Option<&[PositionSpec]>, store: &DynStore) -> Result<Self> {
        match configured {
            Some(specs) => Ok(Self::from_specs(specs)),
            None => Ok(Self::from_candidates(store.candidates().await?)),
        }
    }

    pub fn positions(&self) -> &[String] {
        &self.positions
    }

    pub fn has_position(&self, position: &str) -> bool {
        self.positions.iter().any(|p| p == position)
    }

    /// Candidates standing for the position, in listing order.
    pub fn candidates<'a>(&'a self, position: &'a str) -> impl Iterator<Item = &'a Candidate> {
        self.candidates.iter().filter(move |c| c.position == position)
    }

    pub fn candidate(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }
}
