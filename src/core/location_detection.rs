/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use crate::data::{CatStream, Item, ItemReader, ItemWriter};
use anyhow::Result;
use std::collections::HashMap;

/// Reduces a full 64-bit key hash to the compact hash space of location
/// detection.
pub fn location_hash(hash: u64) -> u32 {
    (hash >> 48) as u32
}

/// A compact per-hash counter record: counts saturate, and a record may be
/// flagged for broadcast (operations that must deliver every key occurrence
/// to every holder, which plain keyed reduction does not need).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCount {
    pub hash: u32,
    pub count: u8,
    pub broadcast: bool,
}

impl HashCount {
    pub fn new(hash: u32) -> Self {
        HashCount {
            hash,
            count: 0,
            broadcast: false,
        }
    }

    /// Merges another record for the same hash; counts saturate.
    pub fn add(&mut self, other: &HashCount) {
        debug_assert_eq!(self.hash, other.hash);
        self.count = self.count.saturating_add(other.count);
        self.broadcast |= other.broadcast;
    }

    pub fn needs_broadcast(&self) -> bool {
        self.broadcast
    }
}

impl Item for HashCount {
    const FIXED_SIZE: Option<usize> = Some(6);

    fn write_to<W: ItemWriter + ?Sized>(&self, writer: &mut W) -> Result<()> {
        self.hash.write_to(writer)?;
        writer.put_byte(self.count)?;
        self.broadcast.write_to(writer)
    }

    fn read_from<R: ItemReader + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(HashCount {
            hash: u32::read_from(reader)?,
            count: reader.get_byte()?,
            broadcast: bool::read_from(reader)?,
        })
    }
}

/// An optional hash-count pre-pass that reduces cross-worker traffic for
/// skewed keyed reductions.
///
/// Every worker counts its keys in a reduced hash space, ships each count
/// to the hash's home worker (`hash % W`), which picks, per hash, the
/// reporting worker holding the most items and answers every reporter with
/// that choice. The main pre-phase then routes by the resulting map instead
/// of `hash % W`, so the heaviest holder of a key receives it instead of a
/// random worker.
pub struct LocationDetection {
    counts: HashMap<u32, HashCount>,
}

impl Default for LocationDetection {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationDetection {
    pub fn new() -> Self {
        LocationDetection {
            counts: HashMap::new(),
        }
    }

    /// Counts one occurrence of a key with the given full hash.
    pub fn insert(&mut self, hash: u64) {
        let reduced = location_hash(hash);
        let record = HashCount {
            hash: reduced,
            count: 1,
            broadcast: false,
        };
        self.counts
            .entry(reduced)
            .and_modify(|existing| existing.add(&record))
            .or_insert(record);
    }

    /// Exchanges the counts and returns this worker's `hash → target
    /// worker` map. `home` and `reply` must be two fresh streams created in
    /// lockstep by all workers.
    pub fn flush(self, home: &CatStream, reply: &CatStream) -> Result<HashMap<u32, u32>> {
        let num_workers = home.num_workers();

        // ship each count to the hash's home worker
        {
            let mut writers = home.open_writers();
            for record in self.counts.values() {
                writers[record.hash as usize % num_workers].put(record)?;
            }
            for mut writer in writers {
                writer.close()?;
            }
        }

        // home side: per hash, the reporter with the most items wins
        let mut best: HashMap<u32, (u8, u32)> = HashMap::new();
        let mut reporters: HashMap<u32, Vec<u32>> = HashMap::new();
        {
            let mut readers = home.open_readers();
            for (src, reader) in readers.iter_mut().enumerate() {
                while reader.has_next() {
                    let record = reader.next::<HashCount>()?;
                    reporters.entry(record.hash).or_default().push(src as u32);
                    let entry = best.entry(record.hash).or_insert((0, 0));
                    if record.count > entry.0 {
                        *entry = (record.count, src as u32);
                    }
                }
            }
        }
        home.close();

        // answer every reporter with the chosen target
        {
            let mut writers = reply.open_writers();
            for (hash, srcs) in &reporters {
                let target = best[hash].1;
                for src in srcs {
                    writers[*src as usize].put(&(*hash, target))?;
                }
            }
            for mut writer in writers {
                writer.close()?;
            }
        }

        let mut locations = HashMap::new();
        {
            let mut reader = reply.open_cat_reader(true);
            while reader.has_next() {
                let (hash, target) = reader.next::<(u32, u32)>()?;
                locations.insert(hash, target);
            }
        }
        reply.close();

        Ok(locations)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hash_count_saturates() {
        let mut a = HashCount {
            hash: 7,
            count: 250,
            broadcast: false,
        };
        let b = HashCount {
            hash: 7,
            count: 10,
            broadcast: true,
        };
        a.add(&b);
        assert_eq!(a.count, u8::MAX);
        assert!(a.needs_broadcast());
    }
}
