//! Mapping of function names to the handlers that run them.
//!
//! Handlers are registered in [`DispatchTable`]s, which are immutable once built. A
//! [`Dispatcher`] holds a stack of tables where later tables shadow earlier ones, and can index
//! them into a trie once registration is complete.

use std::{future::Future, pin::Pin, sync::Arc};

use super::{engine::Rpc, trie::Trie};
use crate::error::RpcError;

/// The future returned by a handler. It borrows the engine for as long as it runs.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a>>;

/// Runs one function on behalf of the peer.
///
/// The inbound message is available through [`Rpc::get_var`] and friends. A handler replies by
/// staging variables with [`Rpc::set_var`] and invoking a function on the peer. Anything that
/// goes wrong is recorded in `e` rather than returned.
///
/// Plain functions with the right signature are handlers:
///
/// ```
/// use p4rpc::{rpc::{HandlerFuture, Rpc}, error::RpcError};
///
/// fn echo<'a>(rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
///     Box::pin(async move {
///         rpc.copy_vars();
///         rpc.invoke("echo-reply").await;
///     })
/// }
/// ```
pub trait Handler: Send + Sync {
    fn call<'a>(&'a self, rpc: &'a mut Rpc, e: &'a mut RpcError) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Rpc, &'a mut RpcError) -> HandlerFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, rpc: &'a mut Rpc, e: &'a mut RpcError) -> HandlerFuture<'a> {
        self(rpc, e)
    }
}

pub type SharedHandler = Arc<dyn Handler>;

/// A list of (function name, handler) entries.
#[derive(Clone, Default)]
pub struct DispatchTable {
    entries: Vec<(String, SharedHandler)>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with<H: Handler + 'static>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.entries.push((name.into(), Arc::new(handler)));
        self
    }

    pub fn with_shared(mut self, name: impl Into<String>, handler: SharedHandler) -> Self {
        self.entries.push((name.into(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// The first entry registered under `name` in this table.
    pub fn find(&self, name: &str) -> Option<&SharedHandler> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, h)| h)
    }
}

/// A stack of dispatch tables searched newest first.
#[derive(Clone, Default)]
pub struct Dispatcher {
    tables: Vec<Arc<DispatchTable>>,
    index: Option<Arc<Trie<SharedHandler>>>,

    /// How many of the tables the index covers. Tables registered afterwards are scanned.
    indexed: usize,
}

fn scan<'t>(tables: &'t [Arc<DispatchTable>], name: &str) -> Option<&'t SharedHandler> {
    tables.iter().rev().find_map(|table| table.find(name))
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table on top of the stack. Its entries shadow same-named entries of every table
    /// registered before it.
    pub fn register(&mut self, table: impl Into<Arc<DispatchTable>>) {
        self.tables.push(table.into());
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.index.is_some()
    }

    /// Builds the trie over every table registered so far.
    pub fn finalize(&mut self) {
        let mut trie = Trie::new();
        for table in &self.tables {
            for name in table.names() {
                if let Some(handler) = scan(&self.tables, name) {
                    trie.insert(name, Arc::clone(handler));
                }
            }
        }

        self.indexed = self.tables.len();
        self.index = Some(Arc::new(trie));
    }

    /// Finds the handler of the newest table that registers `name`.
    pub fn find(&self, name: &str) -> Option<&SharedHandler> {
        let Some(index) = &self.index else {
            return scan(&self.tables, name);
        };

        scan(&self.tables[self.indexed..], name).or_else(|| index.get(name))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::{DispatchTable, Dispatcher, Handler, HandlerFuture, SharedHandler};
    use crate::{error::RpcError, rpc::engine::Rpc};

    struct Tagged;

    impl Handler for Tagged {
        fn call<'a>(&'a self, _rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
            Box::pin(async {})
        }
    }

    fn nothing<'a>(_rpc: &'a mut Rpc, _e: &'a mut RpcError) -> HandlerFuture<'a> {
        Box::pin(async {})
    }

    fn same(a: Option<&SharedHandler>, b: Option<&SharedHandler>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (None, None) => true,
            _ => false,
        }
    }

    #[test]
    fn test_later_tables_shadow_earlier_ones() {
        let base: SharedHandler = Arc::new(Tagged);
        let over: SharedHandler = Arc::new(Tagged);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(DispatchTable::new().with_shared("login", base.clone()).with("logout", nothing));
        dispatcher.register(DispatchTable::new().with_shared("login", over.clone()));

        assert!(same(dispatcher.find("login"), Some(&over)));
        assert!(dispatcher.find("logout").is_some());
        assert!(dispatcher.find("nope").is_none());

        dispatcher.finalize();
        assert!(dispatcher.is_finalized());
        assert!(same(dispatcher.find("login"), Some(&over)));
    }

    #[test]
    fn test_tables_after_finalize_are_scanned() {
        let first: SharedHandler = Arc::new(Tagged);
        let late: SharedHandler = Arc::new(Tagged);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(DispatchTable::new().with_shared("sync", first.clone()));
        dispatcher.finalize();

        dispatcher.register(DispatchTable::new().with_shared("sync", late.clone()).with_shared("new", late.clone()));
        assert_eq!(dispatcher.table_count(), 2);
        assert!(same(dispatcher.find("sync"), Some(&late)));
        assert!(same(dispatcher.find("new"), Some(&late)));
    }

    #[test]
    fn test_first_entry_in_a_table_wins() {
        let a: SharedHandler = Arc::new(Tagged);
        let b: SharedHandler = Arc::new(Tagged);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(DispatchTable::new().with_shared("dup", a.clone()).with_shared("dup", b));
        let before = dispatcher.find("dup").cloned();
        dispatcher.finalize();

        assert!(same(before.as_ref(), Some(&a)));
        assert!(same(dispatcher.find("dup"), Some(&a)));
    }

    proptest! {
        #[test]
        fn prop_trie_matches_scan(
            tables in prop::collection::vec(prop::collection::vec("[a-c]{0,4}", 0..6), 1..5),
            probes in prop::collection::vec("[a-c]{0,5}", 0..20),
        ) {
            let mut dispatcher = Dispatcher::new();
            for names in &tables {
                let table = names.iter().fold(DispatchTable::new(), |t, name| t.with(name.clone(), Tagged));
                dispatcher.register(table);
            }

            let unindexed = dispatcher.clone();
            dispatcher.finalize();

            for name in tables.iter().flatten().chain(probes.iter()) {
                prop_assert!(same(dispatcher.find(name), unindexed.find(name)));
            }
        }
    }
}
