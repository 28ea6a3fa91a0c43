//! A bounded pool of exclusively leased token sessions.
//!
//! Sessions are opened through an `r2d2` connection manager, on demand and up
//! to a maximum, and each is handed out to one caller at a time. The
//! [`SessionPool`] keeps a ledger of idle sessions, leases and creations in
//! progress so that closing the pool can wait for all of them before the
//! sessions are destroyed.

use std::{
    fmt, mem,
    ops::Deref,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use r2d2::ManageConnection;

use crate::{
    error::{Error, TokenError},
    provider::Provider,
};

//------------ SessionFactory ------------------------------------------------

/// Opens sessions on one slot of a token library for the pool.
///
/// Pooled sessions are not logged in individually: the login state of a
/// token is shared by all sessions of the process.
pub struct SessionFactory<P: Provider> {
    provider: Arc<P>,
    slot: P::Slot,
}

impl<P: Provider> SessionFactory<P> {
    pub fn new(provider: Arc<P>, slot: P::Slot) -> Self {
        SessionFactory { provider, slot }
    }
}

impl<P: Provider> fmt::Debug for SessionFactory<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionFactory").field("slot", &self.slot).finish()
    }
}

impl<P: Provider> ManageConnection for SessionFactory<P> {
    type Connection = P::Session;
    type Error = TokenError;

    fn connect(&self) -> Result<P::Session, TokenError> {
        let session = self.provider.open_session(self.slot)?;
        debug!("PKCS#11: Opened pooled session on slot {:?}", self.slot);
        Ok(session)
    }

    fn is_valid(&self, _session: &mut P::Session) -> Result<(), TokenError> {
        Ok(())
    }

    fn has_broken(&self, _session: &mut P::Session) -> bool {
        false
    }
}

//------------ SessionPool ---------------------------------------------------

struct Ledger<C> {
    closed: bool,
    idle: Vec<C>,

    // Sessions that some acquire is creating right now. They count against the maximum.
    opening: usize,

    leased: usize,
}

impl<C> Ledger<C> {
    fn size(&self) -> usize {
        self.idle.len() + self.opening + self.leased
    }
}

/// A pool of sessions leased to one caller at a time.
///
/// Sessions are created on demand by the caller of [`SessionPool::acquire`]
/// itself, so a creation failure is only ever reported to that caller.
/// Closing the pool waits for every lease and every creation in progress.
pub struct SessionPool<M: ManageConnection> {
    factory: M,
    ledger: Mutex<Ledger<M::Connection>>,
    changed: Condvar,
    wait_timeout: Option<Duration>,
    max_size: usize,
}

impl<M: ManageConnection> fmt::Debug for SessionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("max_size", &self.max_size)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

impl<M: ManageConnection> SessionPool<M> {
    /// Creates a pool of at most `max_size` sessions. No session is created up front.
    ///
    /// An acquire waits at most `wait_timeout` for a session, or forever if it is `None`.
    pub fn new(factory: M, max_size: usize, wait_timeout: Option<Duration>) -> Result<Self, Error> {
        if max_size == 0 {
            return Err(Error::invalid_argument("a session pool must hold at least one session"));
        }
        Ok(SessionPool {
            factory,
            ledger: Mutex::new(Ledger {
                closed: false,
                idle: Vec::new(),
                opening: 0,
                leased: 0,
            }),
            changed: Condvar::new(),
            wait_timeout: wait_timeout.filter(|timeout| !timeout.is_zero()),
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.ledger.lock().unwrap().closed
    }

    /// Leases a session.
    ///
    /// Returns an idle session if there is one, creates a new one if the pool
    /// is not yet full and otherwise waits for a session to be returned.
    pub fn acquire(&self) -> Result<Lease<'_, M>, Error> {
        let deadline = self.wait_timeout.map(|timeout| Instant::now() + timeout);
        let mut ledger = self.ledger.lock().unwrap();

        loop {
            if ledger.closed {
                return Err(Error::Closed);
            }

            if let Some(conn) = ledger.idle.pop() {
                ledger.leased += 1;
                trace!("PKCS#11: Leased session");
                return Ok(self.lease(conn));
            }

            if ledger.size() < self.max_size {
                ledger.opening += 1;
                drop(ledger);
                return self.open_session();
            }

            ledger = match (deadline, self.wait_timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("PKCS#11: No session became available within {}ms", timeout.as_millis());
                        return Err(Error::PoolTimeout(timeout));
                    }
                    self.changed.wait_timeout(ledger, deadline - now).unwrap().0
                }
                _ => self.changed.wait(ledger).unwrap(),
            };
        }
    }

    /// Creates a session. The caller has counted it in `opening` already.
    fn open_session(&self) -> Result<Lease<'_, M>, Error> {
        let res = self.factory.connect();

        let mut ledger = self.ledger.lock().unwrap();
        ledger.opening -= 1;
        self.changed.notify_all();

        match res {
            Ok(conn) => {
                if ledger.closed {
                    // Dropped here, before the closing thread can see the pool as drained.
                    drop(conn);
                    return Err(Error::Closed);
                }
                ledger.leased += 1;
                trace!("PKCS#11: Leased new session");
                Ok(self.lease(conn))
            }
            Err(err) => {
                warn!("PKCS#11: Failed to open pooled session: {}", err);
                Err(Error::SessionOpenFailed(err.to_string()))
            }
        }
    }

    fn lease(&self, conn: M::Connection) -> Lease<'_, M> {
        Lease {
            pool: self,
            conn: Some(conn),
        }
    }

    fn release(&self, mut conn: M::Connection) {
        let broken = self.factory.has_broken(&mut conn);
        let mut ledger = self.ledger.lock().unwrap();
        ledger.leased -= 1;
        if broken {
            debug!("PKCS#11: Discarding broken session");
            drop(conn);
        } else {
            ledger.idle.push(conn);
        }
        self.changed.notify_all();
    }

    /// Closes the pool.
    ///
    /// New acquires fail from now on. Blocks until every lease has been
    /// returned and every session being created is finished, then destroys
    /// all sessions. Closing a closed pool fails with [`Error::Closed`].
    pub fn close(&self) -> Result<(), Error> {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.closed {
            return Err(Error::Closed);
        }
        ledger.closed = true;
        self.changed.notify_all();

        if ledger.leased > 0 || ledger.opening > 0 {
            debug!(
                "PKCS#11: Waiting for {} session lease(s) and {} session creation(s) before closing the pool",
                ledger.leased, ledger.opening
            );
        }
        while ledger.leased > 0 || ledger.opening > 0 {
            ledger = self.changed.wait(ledger).unwrap();
        }
        let idle = mem::take(&mut ledger.idle);
        drop(ledger);

        debug!("PKCS#11: Closing {} pooled session(s)", idle.len());
        drop(idle);
        Ok(())
    }

    /// Returns a snapshot of the pool.
    pub fn state(&self) -> PoolState {
        let ledger = self.ledger.lock().unwrap();
        PoolState {
            sessions: ledger.idle.len() + ledger.leased,
            idle: ledger.idle.len(),
            leased: ledger.leased,
            max: self.max_size,
        }
    }
}

//------------ PoolState -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolState {
    /// Sessions currently open, leased or idle.
    pub sessions: usize,
    pub idle: usize,
    pub leased: usize,
    pub max: usize,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} session(s) open ({} idle, {} leased), at most {}",
            self.sessions, self.idle, self.leased, self.max
        )
    }
}

//------------ Lease ---------------------------------------------------------

/// Exclusive use of a pooled session. The session goes back to the pool when the lease is dropped.
pub struct Lease<'a, M: ManageConnection> {
    pool: &'a SessionPool<M>,
    conn: Option<M::Connection>,
}

impl<M: ManageConnection> Deref for Lease<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `drop` takes the connection.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("session lease used after release"),
        }
    }
}

impl<M: ManageConnection> Drop for Lease<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
            trace!("PKCS#11: Returned session");
        }
    }
}

//------------ Tests ---------------------------------------------------------
