//! Participant selection controllers.

use rand::prelude::*;

use super::FederatedError;

/// Chooses which participants train in a round.
pub trait SelectionController: Send {
    /// `k` distinct participant ids from `[0, N)`, in selection order.
    fn indices(&mut self, k: usize) -> Result<Vec<usize>, FederatedError>;

    /// Population size N.
    fn num_participants(&self) -> usize;
}

fn check_count(k: usize, num_participants: usize) -> Result<(), FederatedError> {
    if k == 0 || k > num_participants {
        return Err(FederatedError::contract(format!(
            "cannot select {} of {} participants",
            k, num_participants
        )));
    }
    Ok(())
}

/// Independent uniform sample without replacement every round.
pub struct RandomController {
    num_participants: usize,
    rng: StdRng,
}

impl RandomController {
    pub fn new(num_participants: usize, seed: u64) -> Self {
        Self {
            num_participants,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SelectionController for RandomController {
    fn indices(&mut self, k: usize) -> Result<Vec<usize>, FederatedError> {
        check_count(k, self.num_participants)?;
        Ok(rand::seq::index::sample(&mut self.rng, self.num_participants, k).into_vec())
    }

    fn num_participants(&self) -> usize {
        self.num_participants
    }
}

/// Walks a shuffled permutation of all participants, reshuffling when it
/// runs out, so every participant is picked once before anyone repeats.
pub struct CycleRandomController {
    num_participants: usize,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl CycleRandomController {
    pub fn new(num_participants: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..num_participants).collect();
        order.shuffle(&mut rng);
        Self {
            num_participants,
            rng,
            order,
            cursor: 0,
        }
    }
}

impl SelectionController for CycleRandomController {
    fn indices(&mut self, k: usize) -> Result<Vec<usize>, FederatedError> {
        check_count(k, self.num_participants)?;

        let mut selected = Vec::with_capacity(k);
        while selected.len() < k {
            if self.cursor == self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            let id = self.order[self.cursor];
            self.cursor += 1;
            // A fresh permutation can repeat an id already taken this round.
            if !selected.contains(&id) {
                selected.push(id);
            }
        }
        Ok(selected)
    }

    fn num_participants(&self) -> usize {
        self.num_participants
    }
}
