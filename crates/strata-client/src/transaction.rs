use crate::connection::Connection;
use std::fmt;
use strata_core::StrataError;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    fn clause(self) -> &'static str {
        match self {
            IsolationLevel::Serializable => " ISOLATION SERIALIZABLE",
            IsolationLevel::RepeatableRead => " ISOLATION REPEATABLE READ",
        }
    }
}

/// `None` leaves the choice to the server, or inherits it in a nested block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: Option<IsolationLevel>,
    pub readonly: Option<bool>,
    pub deferrable: Option<bool>,
}

impl TransactionOptions {
    pub fn serializable() -> Self {
        Self {
            isolation: Some(IsolationLevel::Serializable),
            ..Self::default()
        }
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    New,
    Started,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::New => "new",
            TransactionState::Started => "started",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Failed => "failed",
        })
    }
}

/// Command text and bookkeeping for one transaction or savepoint block,
/// independent of any I/O. `top` is the options of the outermost open block
/// on the connection; `next_savepoint` numbers savepoints per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBlock {
    options: TransactionOptions,
    state: TransactionState,
    savepoint: Option<String>,
}

impl TransactionBlock {
    pub fn new(options: TransactionOptions) -> Self {
        Self {
            options,
            state: TransactionState::New,
            savepoint: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn options(&self) -> TransactionOptions {
        self.options
    }

    pub fn is_nested(&self) -> bool {
        self.savepoint.is_some()
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    fn check_not_finished(&self, op: &str) -> Result<(), StrataError> {
        match self.state {
            TransactionState::Committed
            | TransactionState::RolledBack
            | TransactionState::Failed => Err(StrataError::state(format!(
                "cannot {op}; the transaction is {}",
                self.state
            ))),
            _ => Ok(()),
        }
    }

    fn check_started(&self, op: &str) -> Result<(), StrataError> {
        if self.state == TransactionState::New {
            return Err(StrataError::state(format!(
                "cannot {op}; the transaction is not yet started"
            )));
        }
        self.check_not_finished(op)
    }

    pub fn start_query(
        &mut self,
        top: &mut Option<TransactionOptions>,
        next_savepoint: &mut u64,
    ) -> Result<String, StrataError> {
        self.check_not_finished("start")?;
        if self.state == TransactionState::Started {
            return Err(StrataError::state(
                "cannot start; the transaction is already started",
            ));
        }
        let Some(outer) = *top else {
            *top = Some(self.options);
            let mut query = String::from("START TRANSACTION");
            if let Some(isolation) = self.options.isolation {
                query.push_str(isolation.clause());
            }
            match self.options.readonly {
                Some(true) => query.push_str(" READ ONLY"),
                Some(false) => query.push_str(" READ WRITE"),
                None => {}
            }
            match self.options.deferrable {
                Some(true) => query.push_str(" DEFERRABLE"),
                Some(false) => query.push_str(" NOT DEFERRABLE"),
                None => {}
            }
            query.push(';');
            return Ok(query);
        };

        let options = &mut self.options;
        options.isolation = options.isolation.or(outer.isolation);
        options.readonly = options.readonly.or(outer.readonly);
        options.deferrable = options.deferrable.or(outer.deferrable);
        if options.isolation != outer.isolation {
            return Err(StrataError::state(format!(
                "nested transaction has a different isolation level: {:?} != outer {:?}",
                options.isolation, outer.isolation
            )));
        }
        if options.readonly != outer.readonly {
            return Err(StrataError::state(format!(
                "nested transaction has a different read-write mode: {:?} != outer {:?}",
                options.readonly, outer.readonly
            )));
        }
        if options.deferrable != outer.deferrable {
            return Err(StrataError::state(format!(
                "nested transaction has a different deferrable mode: {:?} != outer {:?}",
                options.deferrable, outer.deferrable
            )));
        }
        *next_savepoint += 1;
        let name = format!("sp_{next_savepoint}");
        let query = format!("DECLARE SAVEPOINT {name};");
        self.savepoint = Some(name);
        Ok(query)
    }

    pub fn commit_query(
        &mut self,
        top: &mut Option<TransactionOptions>,
    ) -> Result<String, StrataError> {
        self.check_started("commit")?;
        Ok(match &self.savepoint {
            Some(name) => format!("RELEASE SAVEPOINT {name};"),
            None => {
                *top = None;
                "COMMIT;".to_string()
            }
        })
    }

    pub fn rollback_query(
        &mut self,
        top: &mut Option<TransactionOptions>,
    ) -> Result<String, StrataError> {
        self.check_started("rollback")?;
        Ok(match &self.savepoint {
            Some(name) => format!("ROLLBACK TO SAVEPOINT {name};"),
            None => {
                *top = None;
                "ROLLBACK;".to_string()
            }
        })
    }

    fn settle(&mut self, ok: bool, done: TransactionState, top: &mut Option<TransactionOptions>) {
        if ok {
            self.state = done;
        } else {
            self.state = TransactionState::Failed;
            if self.savepoint.is_none() {
                *top = None;
            }
        }
    }
}

/// An open transaction (or savepoint, when nested) on a connection.
///
/// Dropping it without [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) leaves the server-side block open; later
/// blocks on the same connection then nest inside it.
pub struct Transaction<'a, S> {
    conn: &'a mut Connection<S>,
    block: TransactionBlock,
}

impl<'a, S> Transaction<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn start(
        conn: &'a mut Connection<S>,
        options: TransactionOptions,
    ) -> Result<Transaction<'a, S>, StrataError> {
        conn.ensure_ready()?;
        let mut block = TransactionBlock::new(options);
        let query = block.start_query(&mut conn.top_transaction, &mut conn.next_savepoint)?;
        debug!(%query, "transaction start");
        let result = conn.execute_script(&query).await;
        block.settle(result.is_ok(), TransactionState::Started, &mut conn.top_transaction);
        result?;
        Ok(Transaction { conn, block })
    }

    pub fn state(&self) -> TransactionState {
        self.block.state()
    }

    pub fn block(&self) -> &TransactionBlock {
        &self.block
    }

    pub fn connection(&mut self) -> &mut Connection<S> {
        self.conn
    }

    /// Opens a savepoint inside this block.
    pub async fn nested(
        &mut self,
        options: TransactionOptions,
    ) -> Result<Transaction<'_, S>, StrataError> {
        self.block.check_started("nest")?;
        Transaction::start(&mut *self.conn, options).await
    }

    pub async fn commit(mut self) -> Result<(), StrataError> {
        let query = self.block.commit_query(&mut self.conn.top_transaction)?;
        debug!(%query, "transaction commit");
        let result = self.conn.execute_script(&query).await;
        self.block.settle(
            result.is_ok(),
            TransactionState::Committed,
            &mut self.conn.top_transaction,
        );
        result
    }

    pub async fn rollback(mut self) -> Result<(), StrataError> {
        let query = self.block.rollback_query(&mut self.conn.top_transaction)?;
        debug!(%query, "transaction rollback");
        let result = self.conn.execute_script(&query).await;
        self.block.settle(
            result.is_ok(),
            TransactionState::RolledBack,
            &mut self.conn.top_transaction,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_start_text() {
        let cases = [
            (TransactionOptions::default(), "START TRANSACTION;"),
            (
                TransactionOptions::serializable(),
                "START TRANSACTION ISOLATION SERIALIZABLE;",
            ),
            (
                TransactionOptions {
                    isolation: Some(IsolationLevel::RepeatableRead),
                    readonly: Some(true),
                    deferrable: Some(false),
                },
                "START TRANSACTION ISOLATION REPEATABLE READ READ ONLY NOT DEFERRABLE;",
            ),
            (
                TransactionOptions::default().readonly(false).deferrable(true),
                "START TRANSACTION READ WRITE DEFERRABLE;",
            ),
        ];
        for (options, expected) in cases {
            let mut top = None;
            let mut counter = 0;
            let mut block = TransactionBlock::new(options);
            assert_eq!(
                block.start_query(&mut top, &mut counter).expect("start"),
                expected
            );
            assert_eq!(top, Some(options));
            assert!(!block.is_nested());
        }
    }

    #[test]
    fn nested_blocks_use_savepoints() {
        let mut top = None;
        let mut counter = 0;
        let mut outer = TransactionBlock::new(TransactionOptions::serializable());
        outer.start_query(&mut top, &mut counter).expect("outer");
        outer.state = TransactionState::Started;

        let mut inner = TransactionBlock::new(TransactionOptions::default());
        assert_eq!(
            inner.start_query(&mut top, &mut counter).expect("inner"),
            "DECLARE SAVEPOINT sp_1;"
        );
        assert_eq!(inner.options().isolation, Some(IsolationLevel::Serializable));
        inner.state = TransactionState::Started;
        assert_eq!(
            inner.rollback_query(&mut top).expect("rollback"),
            "ROLLBACK TO SAVEPOINT sp_1;"
        );
        assert!(top.is_some());

        let mut second = TransactionBlock::new(TransactionOptions::default());
        second.start_query(&mut top, &mut counter).expect("second");
        second.state = TransactionState::Started;
        assert_eq!(
            second.commit_query(&mut top).expect("release"),
            "RELEASE SAVEPOINT sp_2;"
        );
        assert_eq!(outer.commit_query(&mut top).expect("commit"), "COMMIT;");
        assert!(top.is_none());
    }

    #[test]
    fn nested_options_must_match_outer() {
        let mut top = Some(TransactionOptions::serializable().readonly(true));
        let mut counter = 0;
        let mut inner = TransactionBlock::new(TransactionOptions::default().readonly(false));
        let err = inner.start_query(&mut top, &mut counter).expect_err("mismatch");
        assert!(matches!(err, StrataError::ProtocolState(_)));
        assert_eq!(counter, 0);

        let mut inner = TransactionBlock::new(TransactionOptions {
            isolation: Some(IsolationLevel::RepeatableRead),
            ..TransactionOptions::default()
        });
        assert!(inner.start_query(&mut top, &mut counter).is_err());
    }

    #[test]
    fn misuse_is_rejected() {
        let mut top = None;
        let mut counter = 0;
        let mut block = TransactionBlock::new(TransactionOptions::default());
        assert!(block.commit_query(&mut top).is_err());
        assert!(block.rollback_query(&mut top).is_err());

        block.start_query(&mut top, &mut counter).expect("start");
        block.settle(true, TransactionState::Started, &mut top);
        assert!(block.start_query(&mut top, &mut counter).is_err());
        block.commit_query(&mut top).expect("commit");
        block.settle(true, TransactionState::Committed, &mut top);
        let err = block.rollback_query(&mut top).expect_err("finished");
        assert!(err.to_string().contains("committed"));
    }

    #[test]
    fn failed_start_releases_the_top_slot() {
        let mut top = None;
        let mut counter = 0;
        let mut block = TransactionBlock::new(TransactionOptions::default());
        block.start_query(&mut top, &mut counter).expect("start");
        block.settle(false, TransactionState::Started, &mut top);
        assert_eq!(block.state(), TransactionState::Failed);
        assert!(top.is_none());
    }
}
