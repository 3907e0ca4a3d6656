//! # Routing Table (XOR metric)
//!
//! One k-bucket per bit of the identifier. A contact lives in bucket `i` where
//! `i` is the highest set bit of `local_id XOR contact_id`, so bucket 159
//! covers half of the keyspace and bucket 0 a single identifier.
//!
//! Inside a bucket contacts are kept least-recently-seen first. A full bucket
//! never drops a live contact for an unverified newcomer: the insert reports
//! [`InsertOutcome::Full`] with the stalest member, the session pings it, and
//! [`RoutingTable::apply_probe_result`] settles which of the two stays.

use std::collections::HashSet;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::Instant;

use crate::config::MAX_CONTACT_FAILURES;
use crate::identity::{Contact, ID_BITS, ID_BYTES, Identifier, sort_by_distance};

#[derive(Debug, Clone)]
struct RoutingEntry {
    contact: Contact,
    failures: u8,
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    entries: Vec<RoutingEntry>,
    last_refresh: Instant,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &Identifier) -> Option<usize> {
        self.entries.iter().position(|e| e.contact.id == *id)
    }

    fn touch(&mut self, contact: Contact, k: usize) -> InsertOutcome {
        if let Some(pos) = self.position(&contact.id) {
            let mut existing = self.entries.remove(pos);
            existing.contact.addr = contact.addr;
            existing.failures = 0;
            self.entries.push(existing);
            self.mark_refreshed();
            return InsertOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(RoutingEntry {
                contact,
                failures: 0,
            });
            self.mark_refreshed();
            return InsertOutcome::Inserted;
        }

        match self.entries.first() {
            Some(oldest) => InsertOutcome::Full {
                candidate: contact,
                oldest: oldest.contact,
            },
            // k == 0 never reaches here: the table clamps k to at least 1.
            None => InsertOutcome::Ignored,
        }
    }

    fn refresh(&mut self, id: &Identifier) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut existing = self.entries.remove(pos);
                existing.failures = 0;
                self.entries.push(existing);
                self.mark_refreshed();
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &Identifier) -> Option<Contact> {
        self.position(id).map(|pos| self.entries.remove(pos).contact)
    }
}

/// Result of [`RoutingTable::insert_or_refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The local identifier; never stored.
    Ignored,
    Inserted,
    /// Already known: moved to the most-recently-seen end, endpoint updated.
    Refreshed,
    /// The owning bucket holds `k` contacts. `oldest` must be probed before
    /// `candidate` may take its place.
    Full { candidate: Contact, oldest: Contact },
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: Identifier,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(local_id: Identifier, k: usize) -> Self {
        Self {
            local_id,
            k: k.max(1),
            buckets: (0..ID_BITS).map(|_| RoutingBucket::new()).collect(),
        }
    }

    pub fn local_id(&self) -> &Identifier {
        &self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn insert_or_refresh(&mut self, contact: Contact) -> InsertOutcome {
        match self.local_id.bucket_index(&contact.id) {
            Some(idx) => self.buckets[idx].touch(contact, self.k),
            None => InsertOutcome::Ignored,
        }
    }

    /// Settle a full-bucket contest once the stalest member was probed.
    ///
    /// A live `oldest` moves to the most-recently-seen end and `candidate` is
    /// discarded. A silent `oldest` is evicted and `candidate` takes the freed
    /// slot straight away.
    pub fn apply_probe_result(&mut self, oldest: &Contact, candidate: Contact, alive: bool) {
        let Some(idx) = self.local_id.bucket_index(&oldest.id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        if alive {
            bucket.refresh(&oldest.id);
            return;
        }

        bucket.remove(&oldest.id);
        if self.local_id.bucket_index(&candidate.id) != Some(idx) {
            return;
        }
        if bucket.position(&candidate.id).is_none() && bucket.entries.len() < self.k {
            bucket.entries.push(RoutingEntry {
                contact: candidate,
                failures: 0,
            });
            bucket.mark_refreshed();
        }
    }

    /// Count a failed request to `id`. Returns `true` when the contact
    /// reached [`MAX_CONTACT_FAILURES`] and was removed.
    pub fn record_failure(&mut self, id: &Identifier) -> bool {
        let Some(idx) = self.local_id.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        let entry = &mut bucket.entries[pos];
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= MAX_CONTACT_FAILURES {
            bucket.entries.remove(pos);
            return true;
        }
        false
    }

    pub fn remove(&mut self, id: &Identifier) -> Option<Contact> {
        let idx = self.local_id.bucket_index(id)?;
        self.buckets[idx].remove(id)
    }

    pub fn get(&self, id: &Identifier) -> Option<Contact> {
        let idx = self.local_id.bucket_index(id)?;
        let bucket = &self.buckets[idx];
        bucket.position(id).map(|pos| bucket.entries[pos].contact)
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.get(id).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Up to `count` contacts ordered by ascending XOR distance to `target`.
    ///
    /// Buckets are visited outward from the target's own bucket: contacts in
    /// that bucket are nearest, every lower bucket shares the next distance
    /// band, and each higher bucket is one band farther out. Scanning stops
    /// once a whole band has been added and the quota is met.
    pub fn closest_to(&self, target: &Identifier, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let mut result: Vec<Contact> = Vec::with_capacity(count.min(self.peer_count()));
        let mut seen: HashSet<Identifier> = HashSet::new();

        let mut take_band = |band: &mut Vec<Contact>, result: &mut Vec<Contact>| {
            sort_by_distance(band, target);
            for contact in band.drain(..) {
                if seen.insert(contact.id) {
                    result.push(contact);
                }
            }
        };

        let mut band = Vec::new();
        let upward_from = match self.local_id.bucket_index(target) {
            Some(t) => {
                band.extend(self.buckets[t].entries.iter().map(|e| e.contact));
                take_band(&mut band, &mut result);
                if result.len() < count {
                    for bucket in &self.buckets[..t] {
                        band.extend(bucket.entries.iter().map(|e| e.contact));
                    }
                    take_band(&mut band, &mut result);
                }
                t + 1
            }
            None => 0,
        };

        for bucket in &self.buckets[upward_from..] {
            if result.len() >= count {
                break;
            }
            band.extend(bucket.entries.iter().map(|e| e.contact));
            take_band(&mut band, &mut result);
        }

        result.truncate(count);
        result
    }

    pub fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.entries.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    /// A random identifier that falls into `bucket_idx` relative to the local id.
    pub fn random_id_for_bucket(&self, bucket_idx: usize) -> Identifier {
        let bucket_idx = bucket_idx.min(ID_BITS - 1);
        let mut distance = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut distance);

        let byte_idx = ID_BYTES - 1 - bucket_idx / 8;
        let target_bit = 1u8 << (bucket_idx % 8);
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

        let local = self.local_id.as_bytes();
        let mut target = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            target[i] = local[i] ^ distance[i];
        }
        Identifier::from_bytes(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::distance_cmp;
    use std::cmp::Ordering;
    use std::net::SocketAddr;

    fn id_from(first: u8, last: u8) -> Identifier {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = first;
        bytes[ID_BYTES - 1] = last;
        Identifier::from_bytes(bytes)
    }

    fn contact(id: Identifier, port: u16) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn zero_table(k: usize) -> RoutingTable {
        RoutingTable::new(Identifier::from_bytes([0u8; ID_BYTES]), k)
    }

    #[tokio::test]
    async fn local_id_is_never_stored() {
        let mut table = zero_table(4);
        let local = *table.local_id();
        assert_eq!(table.insert_or_refresh(contact(local, 1)), InsertOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn full_bucket_offers_least_recently_seen() {
        let mut table = zero_table(4);
        for i in 0..4u8 {
            let outcome = table.insert_or_refresh(contact(id_from(0x80, i), 1000 + i as u16));
            assert_eq!(outcome, InsertOutcome::Inserted);
        }

        // Refreshing the first member makes the second one the stalest.
        assert_eq!(
            table.insert_or_refresh(contact(id_from(0x80, 0), 1000)),
            InsertOutcome::Refreshed
        );

        let newcomer = contact(id_from(0x80, 9), 2000);
        match table.insert_or_refresh(newcomer) {
            InsertOutcome::Full { candidate, oldest } => {
                assert_eq!(candidate, newcomer);
                assert_eq!(oldest.id, id_from(0x80, 1));
            }
            other => panic!("expected full bucket, got {other:?}"),
        }
        assert_eq!(table.peer_count(), 4);
        assert!(!table.contains(&newcomer.id));
    }

    #[tokio::test]
    async fn refresh_updates_endpoint() {
        let mut table = zero_table(4);
        let id = id_from(0x01, 0);
        table.insert_or_refresh(contact(id, 1));
        table.insert_or_refresh(contact(id, 2));
        assert_eq!(table.get(&id).map(|c| c.addr.port()), Some(2));
        assert_eq!(table.peer_count(), 1);
    }

    #[tokio::test]
    async fn live_probe_keeps_oldest_and_drops_candidate() {
        let mut table = zero_table(2);
        let a = contact(id_from(0x80, 1), 1);
        let b = contact(id_from(0x80, 2), 2);
        let c = contact(id_from(0x80, 3), 3);
        table.insert_or_refresh(a);
        table.insert_or_refresh(b);

        table.apply_probe_result(&a, c, true);
        assert!(table.contains(&a.id));
        assert!(!table.contains(&c.id));

        // `a` is now most recently seen, so `b` is offered next.
        match table.insert_or_refresh(c) {
            InsertOutcome::Full { oldest, .. } => assert_eq!(oldest, b),
            other => panic!("expected full bucket, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_probe_replaces_oldest() {
        let mut table = zero_table(2);
        let a = contact(id_from(0x80, 1), 1);
        let b = contact(id_from(0x80, 2), 2);
        let c = contact(id_from(0x80, 3), 3);
        table.insert_or_refresh(a);
        table.insert_or_refresh(b);

        table.apply_probe_result(&a, c, false);
        assert!(!table.contains(&a.id));
        assert!(table.contains(&b.id));
        assert!(table.contains(&c.id));
        assert_eq!(table.peer_count(), 2);
    }

    #[tokio::test]
    async fn repeated_failures_evict_contact() {
        let mut table = zero_table(4);
        let a = contact(id_from(0x40, 1), 1);
        table.insert_or_refresh(a);

        for _ in 1..MAX_CONTACT_FAILURES {
            assert!(!table.record_failure(&a.id));
        }
        // A response in between resets the count.
        table.insert_or_refresh(a);
        for _ in 1..MAX_CONTACT_FAILURES {
            assert!(!table.record_failure(&a.id));
        }
        assert!(table.record_failure(&a.id));
        assert!(!table.contains(&a.id));
    }

    #[tokio::test]
    async fn remove_drops_contact() {
        let mut table = zero_table(4);
        let a = contact(id_from(0x20, 1), 1);
        table.insert_or_refresh(a);
        assert_eq!(table.remove(&a.id), Some(a));
        assert_eq!(table.remove(&a.id), None);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn closest_to_is_bounded_sorted_and_unique() {
        let local = Identifier::random();
        let mut table = RoutingTable::new(local, 8);
        for port in 0..400u16 {
            table.insert_or_refresh(contact(Identifier::random(), port));
        }
        assert!(table.peer_count() <= 8 * ID_BITS);

        for _ in 0..20 {
            let target = Identifier::random();
            for count in [1usize, 3, 8, 20, 1000, usize::MAX] {
                let closest = table.closest_to(&target, count);
                assert!(closest.len() <= count);
                assert_eq!(closest.len(), count.min(table.peer_count()));

                let unique: HashSet<_> = closest.iter().map(|c| c.id).collect();
                assert_eq!(unique.len(), closest.len());

                for pair in closest.windows(2) {
                    let da = pair[0].id.xor_distance(&target);
                    let db = pair[1].id.xor_distance(&target);
                    assert_ne!(distance_cmp(&da, &db), Ordering::Greater);
                }
            }
        }
    }

    #[tokio::test]
    async fn closest_to_matches_exhaustive_sort() {
        let local = Identifier::random();
        let mut table = RoutingTable::new(local, 20);
        let mut all = Vec::new();
        for port in 0..200u16 {
            let c = contact(Identifier::random(), port);
            if table.insert_or_refresh(c) == InsertOutcome::Inserted {
                all.push(c);
            }
        }

        for target in [local, Identifier::random(), Identifier::random()] {
            let mut expected = all.clone();
            sort_by_distance(&mut expected, &target);
            expected.truncate(10);
            assert_eq!(table.closest_to(&target, 10), expected);
        }
    }

    #[tokio::test]
    async fn random_id_for_bucket_lands_in_bucket() {
        let table = RoutingTable::new(Identifier::random(), 8);
        for idx in [0usize, 1, 7, 8, 63, 100, 158, 159] {
            let id = table.random_id_for_bucket(idx);
            assert_eq!(table.local_id().bucket_index(&id), Some(idx));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn populated_buckets_go_stale() {
        let mut table = zero_table(4);
        table.insert_or_refresh(contact(id_from(0x80, 1), 1));
        assert!(table.stale_bucket_indices(Duration::from_secs(60)).is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(table.stale_bucket_indices(Duration::from_secs(60)), vec![159]);

        table.mark_bucket_refreshed(159);
        assert!(table.stale_bucket_indices(Duration::from_secs(60)).is_empty());
    }
}
