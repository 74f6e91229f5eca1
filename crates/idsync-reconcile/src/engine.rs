//! Reconciliation engine.
//!
//! For one content kind and an optional target id set, every id falls in
//! exactly one bucket:
//! - addition: staged in working, absent from content
//! - update: in both, digests differ
//! - unchanged: in both, digests equal
//! - deletion candidate: in content, absent from working
//!
//! Additions, updates and deletions lock the rows they return for the rest
//! of the caller's transaction. Nothing here writes: callers apply changes
//! through the same transaction.

use chrono::{DateTime, Utc};
use tracing::debug;

use idsync_types::{
    ContentPredicate, ContentQuery, ContentRow, ContentTransaction, LockMode, Targets,
    WorkingPredicate, WorkingQuery, WorkingRow,
};

use crate::chunks::{ContentChunks, Ids, Rows, WorkingChunks};
use crate::error::ReconcileError;
use crate::kind::ContentKind;

/// Counts of what a reconciliation pass would do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub additions: u64,
    pub updates: u64,
    pub unchanged: u64,
    pub deletions: u64,
    pub stale: u64,
}

/// Partitions one kind's rows into reconciliation buckets.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileEngine {
    kind: &'static ContentKind,
    chunk_size: usize,
}

impl ReconcileEngine {
    pub fn new(kind: &'static ContentKind, chunk_size: usize) -> Self {
        Self {
            kind,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn for_kind(name: &str, chunk_size: usize) -> Result<Self, ReconcileError> {
        ContentKind::lookup(name)
            .map(|kind| Self::new(kind, chunk_size))
            .ok_or_else(|| ReconcileError::UnknownKind(name.to_string()))
    }

    pub fn kind(&self) -> &'static ContentKind {
        self.kind
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn content_query(&self, targets: &Targets, lock: LockMode) -> ContentQuery {
        let mut query = ContentQuery::new(self.chunk_size);
        if let Targets::Ids(ids) = targets {
            query = query.filter(ContentPredicate::IdIn(ids.clone()));
        }
        query.lock = lock;
        query
    }

    fn additions_query(&self, targets: &Targets, lock: LockMode) -> WorkingQuery {
        let mut query = WorkingQuery::new(self.chunk_size);
        if let Targets::Ids(ids) = targets {
            query = query.filter(WorkingPredicate::IdIn(ids.clone()));
        }
        query = query.filter(WorkingPredicate::NotInContent);
        query.lock = lock;
        query
    }

    fn updates_query(&self, targets: &Targets, lock: LockMode) -> ContentQuery {
        self.content_query(targets, lock)
            .filter(ContentPredicate::DigestDiffersFromWorking)
    }

    fn unchanged_query(&self, targets: &Targets) -> ContentQuery {
        self.content_query(targets, LockMode::None)
            .filter(ContentPredicate::DigestMatchesWorking)
    }

    fn deletions_query(&self, condition: &[ContentPredicate], lock: LockMode) -> ContentQuery {
        self.content_query(&Targets::All, lock)
            .filter(ContentPredicate::Enabled(true))
            .filter(ContentPredicate::NotInWorking)
            .filters(condition.iter().cloned())
    }

    fn rebuilds_query(&self, at: DateTime<Utc>, lock: LockMode) -> ContentQuery {
        self.content_query(&Targets::All, lock)
            .filter(ContentPredicate::StaleAt(at))
    }

    /// Ids staged in working but absent from content, locked.
    pub fn additions<'t, T>(
        &self,
        txn: &'t T,
        targets: &Targets,
    ) -> Ids<Rows<WorkingChunks<'t, T>, WorkingRow>>
    where
        T: ContentTransaction + ?Sized,
    {
        let query = self.additions_query(targets, LockMode::Exclusive);
        Ids(Rows::new(WorkingChunks::new(txn, self.kind.name, query)))
    }

    /// Content rows whose digest differs from their working row, locked.
    pub fn updates<'t, T>(
        &self,
        txn: &'t T,
        targets: &Targets,
    ) -> Rows<ContentChunks<'t, T>, ContentRow>
    where
        T: ContentTransaction + ?Sized,
    {
        let query = self.updates_query(targets, LockMode::Exclusive);
        Rows::new(ContentChunks::new(txn, self.kind.name, query))
    }

    /// Ids present in both tables with equal digests. Not locked.
    pub fn unchanged<'t, T>(
        &self,
        txn: &'t T,
        targets: &Targets,
    ) -> Ids<Rows<ContentChunks<'t, T>, ContentRow>>
    where
        T: ContentTransaction + ?Sized,
    {
        let query = self.unchanged_query(targets);
        Ids(Rows::new(ContentChunks::new(txn, self.kind.name, query)))
    }

    /// Enabled content rows absent from working that also satisfy
    /// `condition`, in locked chunks.
    pub fn deletions<'t, T>(
        &self,
        txn: &'t T,
        condition: &[ContentPredicate],
    ) -> ContentChunks<'t, T>
    where
        T: ContentTransaction + ?Sized,
    {
        let query = self.deletions_query(condition, LockMode::Exclusive);
        ContentChunks::new(txn, self.kind.name, query)
    }

    /// Content rows whose enabled flag disagrees with validity at `at`, in
    /// locked chunks.
    pub fn rebuilds<'t, T>(&self, txn: &'t T, at: DateTime<Utc>) -> ContentChunks<'t, T>
    where
        T: ContentTransaction + ?Sized,
    {
        let query = self.rebuilds_query(at, LockMode::Exclusive);
        ContentChunks::new(txn, self.kind.name, query)
    }

    /// Count every bucket without locking anything.
    pub fn plan<T>(
        &self,
        txn: &T,
        targets: &Targets,
        condition: &[ContentPredicate],
        at: DateTime<Utc>,
    ) -> Result<ReconcilePlan, ReconcileError>
    where
        T: ContentTransaction + ?Sized,
    {
        let kind = self.kind.name;
        let plan = ReconcilePlan {
            additions: count_pages(WorkingChunks::new(
                txn,
                kind,
                self.additions_query(targets, LockMode::None),
            ))?,
            updates: count_pages(ContentChunks::new(
                txn,
                kind,
                self.updates_query(targets, LockMode::None),
            ))?,
            unchanged: count_pages(ContentChunks::new(txn, kind, self.unchanged_query(targets)))?,
            deletions: count_pages(ContentChunks::new(
                txn,
                kind,
                self.deletions_query(condition, LockMode::None),
            ))?,
            stale: count_pages(ContentChunks::new(
                txn,
                kind,
                self.rebuilds_query(at, LockMode::None),
            ))?,
        };
        debug!(kind, ?plan, "Computed reconcile plan");
        Ok(plan)
    }
}

fn count_pages<I, R>(pages: I) -> Result<u64, ReconcileError>
where
    I: Iterator<Item = Result<Vec<R>, ReconcileError>>,
{
    let mut total = 0u64;
    for page in pages {
        total += page?.len() as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use idsync_storage::Storage;
    use idsync_types::{Attributes, Store, StoreTransaction, Validity};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn user(id: &str, login: &str) -> ContentRow {
        user_with_validity(id, login, Validity::always())
    }

    fn user_with_validity(id: &str, login: &str, validity: Validity) -> ContentRow {
        let mut attributes = Attributes::new();
        attributes.insert("login".to_string(), json!(login));
        ContentKind::lookup("USER")
            .unwrap()
            .prepare(id, attributes, validity, now())
            .unwrap()
    }

    fn seed(storage: &Storage, content: &[ContentRow], working: &[ContentRow]) {
        let txn = storage.begin().unwrap();
        for row in content {
            txn.put_content(row).unwrap();
        }
        let staged: Vec<WorkingRow> = working.iter().cloned().map(WorkingRow::stage).collect();
        txn.append_working_rows("USER", &staged).unwrap();
        txn.commit().unwrap();
    }

    fn collect_ids<I>(iter: I) -> BTreeSet<String>
    where
        I: Iterator<Item = Result<String, ReconcileError>>,
    {
        iter.map(|r| r.unwrap()).collect()
    }

    fn engine(chunk: usize) -> ReconcileEngine {
        ReconcileEngine::for_kind("USER", chunk).unwrap()
    }

    #[test]
    fn test_buckets_for_mixed_rows() {
        let (storage, _temp) = create_test_storage();
        // content {A:d1, B:d2}, working {A:d1, B:d3, C:d4}
        seed(
            &storage,
            &[user("A", "a"), user("B", "b")],
            &[user("A", "a"), user("B", "b2"), user("C", "c")],
        );

        let txn = storage.begin().unwrap();
        let engine = engine(10);

        let additions = collect_ids(engine.additions(&txn, &Targets::All));
        assert_eq!(additions, ["C".to_string()].into_iter().collect());

        let updates: Vec<String> = engine
            .updates(&txn, &Targets::All)
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(updates, vec!["B".to_string()]);

        let unchanged = collect_ids(engine.unchanged(&txn, &Targets::All));
        assert_eq!(unchanged, ["A".to_string()].into_iter().collect());

        let deletions: Vec<ContentRow> = engine
            .deletions(&txn, &[])
            .flat_map(|page| page.unwrap())
            .collect();
        assert!(deletions.is_empty());
    }

    #[test]
    fn test_digest_is_the_only_change_criterion() {
        let (storage, _temp) = create_test_storage();
        let with_digest = |login: &str, digest: &str| {
            let mut row = user("X", login);
            row.digest = digest.to_string();
            row
        };
        // Attributes differ but digests match: not an update
        seed(&storage, &[with_digest("old", "d1")], &[with_digest("new", "d1")]);

        let engine = engine(10);
        let txn = storage.begin().unwrap();
        assert!(collect_ids(engine.additions(&txn, &Targets::All)).is_empty());
        assert_eq!(engine.updates(&txn, &Targets::All).count(), 0);
        txn.rollback().unwrap();

        let txn = storage.begin().unwrap();
        txn.put_content(&with_digest("old", "d2")).unwrap();
        let updates: Vec<String> = engine
            .updates(&txn, &Targets::All)
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(updates, vec!["X".to_string()]);
        assert!(collect_ids(engine.additions(&txn, &Targets::All)).is_empty());
    }

    #[test]
    fn test_partition_covers_each_id_once() {
        let (storage, _temp) = create_test_storage();
        let content: Vec<ContentRow> = (0..7).map(|i| user(&format!("u{i}"), "x")).collect();
        let working: Vec<ContentRow> = (3..12)
            .map(|i| user(&format!("u{i}"), if i % 2 == 0 { "x" } else { "y" }))
            .collect();
        seed(&storage, &content, &working);

        let txn = storage.begin().unwrap();
        let engine = engine(2);
        let additions = collect_ids(engine.additions(&txn, &Targets::All));
        let updates: BTreeSet<String> = engine
            .updates(&txn, &Targets::All)
            .map(|r| r.unwrap().id)
            .collect();
        let unchanged = collect_ids(engine.unchanged(&txn, &Targets::All));
        let deletions: BTreeSet<String> = engine
            .deletions(&txn, &[])
            .flat_map(|page| page.unwrap())
            .map(|r| r.id)
            .collect();

        let working_ids: BTreeSet<String> = working.iter().map(|r| r.id.clone()).collect();
        let content_ids: BTreeSet<String> = content.iter().map(|r| r.id.clone()).collect();

        let mut seen = BTreeSet::new();
        for bucket in [&additions, &updates, &unchanged] {
            for id in bucket {
                assert!(seen.insert(id.clone()), "{id} in two buckets");
            }
        }
        assert_eq!(seen, working_ids);
        assert!(additions.iter().all(|id| !content_ids.contains(id)));
        assert_eq!(
            deletions,
            content_ids.difference(&working_ids).cloned().collect()
        );
    }

    #[test]
    fn test_targets_restrict_buckets() {
        let (storage, _temp) = create_test_storage();
        seed(
            &storage,
            &[user("A", "a"), user("B", "b")],
            &[user("A", "a2"), user("B", "b2"), user("C", "c"), user("D", "d")],
        );

        let txn = storage.begin().unwrap();
        let targets = Targets::ids(["B", "D"]);
        let engine = engine(10);
        let additions = collect_ids(engine.additions(&txn, &targets));
        assert_eq!(additions, ["D".to_string()].into_iter().collect());
        let updates: Vec<String> = engine
            .updates(&txn, &targets)
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(updates, vec!["B".to_string()]);
    }

    #[test]
    fn test_deletions_skip_disabled_and_honor_condition() {
        let (storage, _temp) = create_test_storage();
        let mut disabled = user("gone-already", "z");
        disabled.enabled = false;
        let mut scoped = user("scoped", "s");
        scoped
            .attributes
            .insert("org_id".to_string(), json!("acme"));
        seed(
            &storage,
            &[user("keep", "k"), user("drop", "d"), disabled, scoped],
            &[user("keep", "k")],
        );

        let txn = storage.begin().unwrap();
        let all: BTreeSet<String> = engine(1)
            .deletions(&txn, &[])
            .flat_map(|page| page.unwrap())
            .map(|r| r.id)
            .collect();
        assert_eq!(
            all,
            ["drop".to_string(), "scoped".to_string()].into_iter().collect()
        );

        let condition = [ContentPredicate::AttributeEquals {
            name: "org_id".to_string(),
            value: json!("acme"),
        }];
        let pages: Vec<Vec<ContentRow>> = engine(1)
            .deletions(&txn, &condition)
            .map(|page| page.unwrap())
            .collect();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0][0].id, "scoped");
    }

    #[test]
    fn test_rebuilds_find_only_stale_rows() {
        let (storage, _temp) = create_test_storage();
        let expires = Validity::new(None, Some(now() + Duration::hours(1)));
        let starts = Validity::new(Some(now() + Duration::hours(1)), None);
        seed(
            &storage,
            &[
                user_with_validity("expiring", "e", expires),
                user_with_validity("starting", "s", starts),
                user("steady", "t"),
            ],
            &[],
        );

        let txn = storage.begin().unwrap();
        let engine = engine(10);
        assert_eq!(engine.rebuilds(&txn, now()).count(), 0);

        let later = now() + Duration::hours(2);
        let stale: BTreeSet<String> = engine
            .rebuilds(&txn, later)
            .flat_map(|page| page.unwrap())
            .map(|r| r.id)
            .collect();
        assert_eq!(
            stale,
            ["expiring".to_string(), "starting".to_string()]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn test_chunks_respect_size() {
        let (storage, _temp) = create_test_storage();
        let content: Vec<ContentRow> = (0..5).map(|i| user(&format!("u{i}"), "x")).collect();
        seed(&storage, &content, &[]);

        let txn = storage.begin().unwrap();
        let sizes: Vec<usize> = engine(2)
            .deletions(&txn, &[])
            .map(|page| page.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_plan_counts_without_locking() {
        let (storage, _temp) = create_test_storage();
        seed(
            &storage,
            &[user("A", "a"), user("B", "b"), user("E", "e")],
            &[user("A", "a"), user("B", "b2"), user("C", "c")],
        );

        let txn = storage.begin().unwrap();
        let plan = engine(2).plan(&txn, &Targets::All, &[], now()).unwrap();
        assert_eq!(
            plan,
            ReconcilePlan {
                additions: 1,
                updates: 1,
                unchanged: 1,
                deletions: 1,
                stale: 0,
            }
        );

        // A second transaction can still lock everything.
        let other = storage.begin().unwrap();
        assert_eq!(engine(10).updates(&other, &Targets::All).count(), 1);
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            ReconcileEngine::for_kind("DEVICE", 10),
            Err(ReconcileError::UnknownKind(_))
        ));
    }
}
