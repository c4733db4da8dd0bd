//! Feeders supply per-user parameter records.
//!
//! A feeder is shared by every virtual user of a population and drawn from under a
//! mutex, so concurrent starts never observe the same record of a single-shot feeder.
//!
//! | strategy   | order            | exhausts |
//! |------------|------------------|----------|
//! | `Queue`    | declared         | yes      |
//! | `Shuffle`  | shuffled once    | yes      |
//! | `Circular` | declared, looped | never    |
//! | `Random`   | uniform picks    | never    |
//!
//! Generator feeders ([`Feeder::generator`]) build every record on demand and never
//! exhaust either.
use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::session::Value;

/// One parameter record: field name to value.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStrategy {
    #[default]
    Queue,
    Shuffle,
    Circular,
    Random,
}

impl FeedStrategy {
    /// Whether the feeder can run out of records.
    pub fn is_finite(self) -> bool {
        matches!(self, FeedStrategy::Queue | FeedStrategy::Shuffle)
    }
}

/// Returned when a single-shot feeder has handed out every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted;

enum Source {
    Records {
        records: Vec<Record>,
        strategy: FeedStrategy,
        cursor: usize,
    },
    Generator(fn(&mut StdRng) -> Record),
}

struct State {
    source: Source,
    rng: StdRng,
}

pub struct Feeder {
    name: String,
    fields: BTreeSet<String>,
    strategy: FeedStrategy,
    state: Mutex<State>,
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("fields", &self.fields)
            .finish()
    }
}

impl Feeder {
    /// Builds a record feeder seeded from the OS entropy source.
    pub fn new(name: impl Into<String>, records: Vec<Record>, strategy: FeedStrategy) -> Self {
        Self::with_rng(name, records, strategy, StdRng::from_os_rng())
    }

    /// Builds a record feeder whose shuffling and random picks are reproducible.
    pub fn seeded(
        name: impl Into<String>,
        records: Vec<Record>,
        strategy: FeedStrategy,
        seed: u64,
    ) -> Self {
        Self::with_rng(name, records, strategy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        name: impl Into<String>,
        mut records: Vec<Record>,
        strategy: FeedStrategy,
        mut rng: StdRng,
    ) -> Self {
        if strategy == FeedStrategy::Shuffle {
            records.shuffle(&mut rng);
        }
        let fields = records
            .iter()
            .flat_map(|r| r.keys().cloned())
            .collect::<BTreeSet<_>>();
        Self {
            name: name.into(),
            fields,
            strategy,
            state: Mutex::new(State {
                source: Source::Records {
                    records,
                    strategy,
                    cursor: 0,
                },
                rng,
            }),
        }
    }

    /// Builds an infinite feeder producing each record with `generate`.
    ///
    /// `fields` declares the record fields up front so that duplicate fields
    /// across feeders can be rejected when the scenario is built.
    pub fn generator<I, S>(
        name: impl Into<String>,
        fields: I,
        seed: u64,
        generate: fn(&mut StdRng) -> Record,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            strategy: FeedStrategy::Circular,
            state: Mutex::new(State {
                source: Source::Generator(generate),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    pub fn is_finite(&self) -> bool {
        let state = self.state.lock();
        matches!(state.source, Source::Records { strategy, .. } if strategy.is_finite())
    }

    /// Draws the next record.
    pub fn next_record(&self) -> Result<Record, Exhausted> {
        let mut state = self.state.lock();
        let State { source, rng } = &mut *state;
        match source {
            Source::Generator(generate) => Ok(generate(rng)),
            Source::Records {
                records,
                strategy,
                cursor,
            } => {
                if records.is_empty() {
                    return Err(Exhausted);
                }
                match strategy {
                    FeedStrategy::Queue | FeedStrategy::Shuffle => {
                        let record = records.get(*cursor).cloned().ok_or(Exhausted)?;
                        *cursor += 1;
                        Ok(record)
                    }
                    FeedStrategy::Circular => {
                        let record = records[*cursor % records.len()].clone();
                        *cursor = (*cursor + 1) % records.len();
                        Ok(record)
                    }
                    FeedStrategy::Random => {
                        let index = rng.random_range(0..records.len());
                        Ok(records[index].clone())
                    }
                }
            }
        }
    }

    /// Records left in a single-shot feeder, `None` for infinite feeders.
    pub fn remaining(&self) -> Option<usize> {
        let state = self.state.lock();
        match &state.source {
            Source::Records {
                records,
                strategy,
                cursor,
            } if strategy.is_finite() => Some(records.len().saturating_sub(*cursor)),
            _ => None,
        }
    }
}
