//! Two-phase locking transactions with a predeclared lock set.
//!
//! A transaction collects statements, then `run` analyzes them to compute
//! the set of primary keys to lock, acquires every lock non-blocking (any
//! contention aborts the whole transaction), executes the statements in
//! submission order, and releases. Because acquisition never waits there is
//! no waits-for graph and no deadlock; callers retry aborted transactions
//! at a higher level.

use std::sync::Arc;

use common::ColumnId;
use engine::Table;
use hashbrown::HashMap;
use lock::{LockHandle, LockKind};
use tracing::debug;

/// One deferred query operation.
#[derive(Clone, Debug)]
pub enum Statement {
    Insert { values: Vec<i64> },
    Select { key: i64, key_column: ColumnId, columns: Vec<bool> },
    Update { key: i64, values: Vec<Option<i64>> },
    Delete { key: i64 },
    Sum { start: i64, end: i64, column: ColumnId },
    Increment { key: i64, column: ColumnId },
}

#[derive(Default)]
pub struct Transaction {
    table: Option<Arc<Table>>,
    statements: Vec<Statement>,
    locks: Vec<LockHandle>,
    aborted: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a statement. The first call latches the transaction onto the
    /// table (and thereby its lock manager).
    pub fn add_statement(&mut self, table: &Arc<Table>, statement: Statement) {
        if self.table.is_none() {
            self.table = Some(Arc::clone(table));
        }
        self.statements.push(statement);
    }

    /// Runs the transaction to completion. Returns 1 on commit, 0 on abort.
    pub fn run(&mut self) -> usize {
        let Some(table) = self.table.clone() else {
            return 1;
        };

        let lock_set = self.preprocess(&table);
        self.acquire_locks(&table, lock_set);
        if self.aborted {
            return 0;
        }

        for statement in self.statements.clone() {
            Self::execute(&table, statement);
        }

        self.release_locks();
        1
    }

    /// Releases all held locks and marks the transaction aborted.
    pub fn abort(&mut self) {
        self.release_locks();
        self.aborted = true;
    }

    /// No-op: statements materialize their writes as they execute, already
    /// serialized by the pre-acquired locks.
    pub fn commit(&mut self) {}

    /// Computes `primary key -> lock kind` for every queued statement.
    /// A key requested both shared and exclusive stays exclusive.
    fn preprocess(&self, table: &Table) -> HashMap<i64, LockKind> {
        let key_index = table.key_index();
        let mut lock_set: HashMap<i64, LockKind> = HashMap::new();

        for statement in &self.statements {
            let (kind, keys) = match statement {
                Statement::Insert { values } => (
                    LockKind::Exclusive,
                    values.get(key_index).copied().into_iter().collect(),
                ),
                Statement::Update { key, .. }
                | Statement::Delete { key }
                | Statement::Increment { key, .. } => (LockKind::Exclusive, vec![*key]),
                Statement::Select { key, key_column, .. } => {
                    if *key_column == key_index {
                        (LockKind::Shared, vec![*key])
                    } else {
                        // Resolve the secondary lookup to the primary keys of
                        // every matching base record.
                        let rids = table
                            .locate(*key, *key_column)
                            .ok()
                            .flatten()
                            .unwrap_or_default();
                        (LockKind::Shared, table.primary_keys_of(&rids))
                    }
                }
                Statement::Sum { start, end, .. } => {
                    let step: i64 = if end >= start { 1 } else { -1 };
                    let mut keys = Vec::new();
                    let mut key = *start;
                    loop {
                        if matches!(table.locate(key, key_index), Ok(Some(_))) {
                            keys.push(key);
                        }
                        if key == *end {
                            break;
                        }
                        key += step;
                    }
                    (LockKind::Shared, keys)
                }
            };

            for key in keys {
                lock_set
                    .entry(key)
                    .and_modify(|existing| {
                        if kind == LockKind::Exclusive {
                            *existing = LockKind::Exclusive;
                        }
                    })
                    .or_insert(kind);
            }
        }
        lock_set
    }

    fn acquire_locks(&mut self, table: &Table, lock_set: HashMap<i64, LockKind>) {
        for (key, kind) in lock_set {
            match table.lock_manager().acquire(key, kind) {
                Ok(handle) => self.locks.push(handle),
                Err(err) => {
                    debug!(key, %err, "aborting transaction");
                    self.abort();
                    return;
                }
            }
        }
    }

    fn release_locks(&mut self) {
        self.locks.clear();
    }

    /// Statement outcomes are not surfaced; failures inside a committed
    /// transaction mirror the non-transactional query boundary.
    fn execute(table: &Table, statement: Statement) {
        let result = match statement {
            Statement::Insert { values } => table.insert(&values).map(|_| ()),
            Statement::Select { key, key_column, columns } => {
                table.select(key, key_column, &columns).map(|_| ())
            }
            Statement::Update { key, values } => table.update(key, &values).map(|_| ()),
            Statement::Delete { key } => table.delete(key).map(|_| ()),
            Statement::Sum { start, end, column } => table.sum(start, end, column).map(|_| ()),
            Statement::Increment { key, column } => table.increment(key, column).map(|_| ()),
        };
        if let Err(err) = result {
            debug!(%err, "transactional statement failed");
        }
    }
}

/// Thread-confined driver executing a batch of transactions sequentially.
///
/// `result` counts the transactions that committed; `stats` keeps the
/// per-transaction outcomes in execution order. Workers on different
/// threads coordinate purely through the lock manager and cache latches.
#[derive(Default)]
pub struct TransactionWorker {
    transactions: Vec<Transaction>,
    pub stats: Vec<usize>,
    pub result: usize,
}

impl TransactionWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn run(&mut self) {
        for transaction in &mut self.transactions {
            self.stats.push(transaction.run());
        }
        self.result = self.stats.iter().filter(|&&status| status == 1).count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Config;
    use tempfile::tempdir;

    fn temp_table(num_columns: usize) -> (Arc<Table>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let appendix = dir.path().join("t").to_string_lossy().into_owned();
        let config = Config::builder().cache_pages(32).merge_epoch(8).build();
        let table = Arc::new(Table::create(&appendix, num_columns, 0, &config).unwrap());
        (table, dir)
    }

    #[test]
    fn transaction_executes_statements_in_order() {
        let (table, _dir) = temp_table(2);

        let mut txn = Transaction::new();
        txn.add_statement(&table, Statement::Insert { values: vec![1, 10] });
        txn.add_statement(
            &table,
            Statement::Update { key: 1, values: vec![None, Some(20)] },
        );
        assert_eq!(txn.run(), 1);

        let records = table.select(1, 0, &[true, true]).unwrap();
        assert_eq!(records[0].columns, vec![Some(1), Some(20)]);
    }

    #[test]
    fn empty_transaction_commits() {
        let mut txn = Transaction::new();
        assert_eq!(txn.run(), 1);
    }

    #[test]
    fn writer_wins_over_reader_in_the_lock_set() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 10]).unwrap();

        let mut txn = Transaction::new();
        txn.add_statement(
            &table,
            Statement::Select { key: 1, key_column: 0, columns: vec![true, true] },
        );
        txn.add_statement(
            &table,
            Statement::Update { key: 1, values: vec![None, Some(11)] },
        );
        let lock_set = txn.preprocess(&table);
        assert_eq!(lock_set.get(&1), Some(&LockKind::Exclusive));
    }

    #[test]
    fn contended_key_aborts_without_executing() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 10]).unwrap();

        // An outside writer holds key 1.
        let held = table.lock_manager().acquire(1, LockKind::Exclusive).unwrap();

        let mut txn = Transaction::new();
        txn.add_statement(
            &table,
            Statement::Update { key: 1, values: vec![None, Some(99)] },
        );
        assert_eq!(txn.run(), 0);

        // The update never ran.
        let records = table.select(1, 0, &[true, true]).unwrap();
        assert_eq!(records[0].columns, vec![Some(1), Some(10)]);

        table.lock_manager().release(held);
    }

    #[test]
    fn aborted_transaction_releases_its_locks() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 10]).unwrap();
        table.insert(&[2, 20]).unwrap();

        let held = table.lock_manager().acquire(2, LockKind::Exclusive).unwrap();

        // Wants 1 and 2; 2 is contended, so 1 must be released on abort.
        let mut txn = Transaction::new();
        txn.add_statement(
            &table,
            Statement::Update { key: 1, values: vec![None, Some(11)] },
        );
        txn.add_statement(
            &table,
            Statement::Update { key: 2, values: vec![None, Some(21)] },
        );
        assert_eq!(txn.run(), 0);

        assert!(table.lock_manager().acquire(1, LockKind::Exclusive).is_ok());
        table.lock_manager().release(held);
    }

    #[test]
    fn sum_locks_only_existing_keys() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 10]).unwrap();
        table.insert(&[3, 30]).unwrap();

        let mut txn = Transaction::new();
        txn.add_statement(&table, Statement::Sum { start: 1, end: 3, column: 1 });
        let lock_set = txn.preprocess(&table);

        assert_eq!(lock_set.len(), 2);
        assert_eq!(lock_set.get(&1), Some(&LockKind::Shared));
        assert_eq!(lock_set.get(&3), Some(&LockKind::Shared));
    }

    #[test]
    fn secondary_select_locks_matching_primary_keys() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 7]).unwrap();
        table.insert(&[2, 7]).unwrap();
        table.insert(&[3, 8]).unwrap();
        table.build_index(1).unwrap();

        let mut txn = Transaction::new();
        txn.add_statement(
            &table,
            Statement::Select { key: 7, key_column: 1, columns: vec![true, true] },
        );
        let lock_set = txn.preprocess(&table);

        assert_eq!(lock_set.len(), 2);
        assert!(lock_set.contains_key(&1));
        assert!(lock_set.contains_key(&2));
    }

    #[test]
    fn concurrent_writers_on_one_key_serialize_or_abort() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 0]).unwrap();

        let mut handles = Vec::new();
        for worker_id in 0..4i64 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let mut worker = TransactionWorker::new();
                let mut txn = Transaction::new();
                txn.add_statement(
                    &table,
                    Statement::Update { key: 1, values: vec![None, Some(worker_id)] },
                );
                worker.add_transaction(txn);
                worker.run();
                worker.result
            }));
        }

        let committed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Losers abort rather than wait; at least one writer must win.
        assert!((1..=4).contains(&committed));

        // The surviving value belongs to one of the winners.
        let value = table.select(1, 0, &[true, true]).unwrap()[0].columns[1].unwrap();
        assert!((0..4).contains(&value));
    }

    #[test]
    fn worker_counts_committed_transactions() {
        let (table, _dir) = temp_table(2);
        table.insert(&[1, 10]).unwrap();

        let held = table.lock_manager().acquire(1, LockKind::Exclusive).unwrap();

        let mut worker = TransactionWorker::new();

        let mut ok = Transaction::new();
        ok.add_statement(&table, Statement::Insert { values: vec![5, 50] });
        worker.add_transaction(ok);

        let mut blocked = Transaction::new();
        blocked.add_statement(
            &table,
            Statement::Update { key: 1, values: vec![None, Some(0)] },
        );
        worker.add_transaction(blocked);

        worker.run();
        assert_eq!(worker.stats, vec![1, 0]);
        assert_eq!(worker.result, 1);

        table.lock_manager().release(held);
    }
}
