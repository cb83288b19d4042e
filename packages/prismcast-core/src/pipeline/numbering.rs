//! Channel numbering stage.
//!
//! Three modes: preserve source numbers (duplicates resolved by source
//! priority, then original order), sequential 1..N, and per-source
//! 1000-wide disjoint ranges.

use std::collections::{BTreeMap, HashSet};

use super::model::{Channel, NumberingMode};

/// Width of each source's range in source-based numbering.
const SOURCE_RANGE_WIDTH: u32 = 1000;

/// Assigns final channel numbers in place.
pub fn apply_numbering(channels: &mut [Channel], mode: NumberingMode) {
    match mode {
        NumberingMode::Sequential => sequential(channels),
        NumberingMode::Preserve => preserve(channels),
        NumberingMode::SourceBased => source_based(channels),
    }
}

/// 1..N in source order, stable.
fn sequential(channels: &mut [Channel]) {
    for (i, channel) in channels.iter_mut().enumerate() {
        channel.number = Some(i as u32 + 1);
    }
}

/// Keeps source numbers. When several channels claim the same number, the
/// one from the highest-priority source (lowest value) wins, original
/// order breaking ties; losers move to the first free number above.
fn preserve(channels: &mut [Channel]) {
    let mut claims: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    let mut unnumbered: Vec<usize> = Vec::new();

    for (idx, channel) in channels.iter().enumerate() {
        match channel.number {
            Some(number) => claims.entry(number).or_default().push(idx),
            None => unnumbered.push(idx),
        }
    }

    let mut taken: HashSet<u32> = HashSet::new();
    let mut displaced: Vec<usize> = Vec::new();

    for (number, mut claimants) in claims {
        // Source priority first, original order second.
        claimants.sort_by_key(|&idx| (channels[idx].source_priority, idx));
        let mut winners = claimants.into_iter();
        if let Some(winner) = winners.next() {
            channels[winner].number = Some(number);
            taken.insert(number);
        }
        displaced.extend(winners);
    }

    // Displaced and unnumbered channels fill the gaps in original order.
    displaced.extend(unnumbered);
    displaced.sort_unstable();
    let mut next_free = 1u32;
    for idx in displaced {
        while taken.contains(&next_free) {
            next_free += 1;
        }
        channels[idx].number = Some(next_free);
        taken.insert(next_free);
    }
}

/// Each source gets a disjoint 1000-wide range; numbering inside a range
/// starts at 1 and follows source order. Range order follows first
/// appearance of the source in the channel list.
fn source_based(channels: &mut [Channel]) {
    let mut source_base: BTreeMap<String, u32> = BTreeMap::new();
    let mut source_next: BTreeMap<String, u32> = BTreeMap::new();
    let mut next_base = 0u32;

    for channel in channels.iter_mut() {
        let base = *source_base
            .entry(channel.source_id.clone())
            .or_insert_with(|| {
                let base = next_base;
                next_base += SOURCE_RANGE_WIDTH;
                base
            });
        let offset = source_next.entry(channel.source_id.clone()).or_insert(1);
        channel.number = Some(base + *offset);
        *offset += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str, source: &str, priority: i32, number: Option<u32>) -> Channel {
        Channel {
            id: name.into(),
            tvg_id: name.into(),
            tvg_name: name.into(),
            name: name.into(),
            logo_url: None,
            group: None,
            stream_url: "http://e".into(),
            source_id: source.into(),
            source_priority: priority,
            number,
        }
    }

    #[test]
    fn sequential_is_stable() {
        let mut channels = vec![
            channel("A", "s1", 0, Some(50)),
            channel("B", "s1", 0, None),
            channel("C", "s2", 0, Some(3)),
        ];
        apply_numbering(&mut channels, NumberingMode::Sequential);
        let numbers: Vec<u32> = channels.iter().filter_map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn preserve_resolves_duplicates_by_priority_then_order() {
        let mut channels = vec![
            channel("A", "s1", 5, Some(10)),
            channel("B", "s2", 1, Some(10)), // higher priority source wins
            channel("C", "s3", 5, Some(10)),
        ];
        apply_numbering(&mut channels, NumberingMode::Preserve);
        assert_eq!(channels[1].number, Some(10));
        // Losers take the lowest free numbers, in original order.
        assert_eq!(channels[0].number, Some(1));
        assert_eq!(channels[2].number, Some(2));
    }

    #[test]
    fn preserve_keeps_unique_numbers() {
        let mut channels = vec![
            channel("A", "s1", 0, Some(7)),
            channel("B", "s1", 0, Some(3)),
            channel("C", "s1", 0, None),
        ];
        apply_numbering(&mut channels, NumberingMode::Preserve);
        assert_eq!(channels[0].number, Some(7));
        assert_eq!(channels[1].number, Some(3));
        assert_eq!(channels[2].number, Some(1));
    }

    #[test]
    fn source_based_ranges_are_disjoint() {
        let mut channels = vec![
            channel("A", "s1", 0, None),
            channel("B", "s2", 0, None),
            channel("C", "s1", 0, None),
        ];
        apply_numbering(&mut channels, NumberingMode::SourceBased);
        assert_eq!(channels[0].number, Some(1));
        assert_eq!(channels[1].number, Some(1001));
        assert_eq!(channels[2].number, Some(2));
    }
}
