// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Persistent actors
//!
//! A [`PersistentActor`] journals the events it applies to its state and
//! can be recovered from storage: on activation the last snapshot is loaded
//! and the tail of the event log replayed on top; on passivation the state
//! is flushed as a new snapshot. The journal and snapshots are owned by a
//! [`Store`] child actor, so persistence follows the same mailbox
//! discipline as every other effect.
//!

use crate::{
    database::{Collection, DbManager},
    error::Error,
};

use actor::{
    Actor, ActorContext, ActorPath, Error as ActorError, Handler, Message,
    Response,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, error};

use std::{fmt::Debug, marker::PhantomData, sync::Arc};

/// Name of the system helper holding the `Arc<dyn DbManager>` used to
/// create stores.
pub const STORE_MANAGER: &str = "store_manager";

/// An actor whose state survives passivation and restarts.
///
/// The actor's `Event` type is its journal entry: `apply` must be a pure
/// state transition, and `persist` writes the event ahead of applying it.
/// `start_store`/`stop_store` bracket the actor's activation and
/// passivation.
#[async_trait]
pub trait PersistentActor:
    Actor + Handler<Self> + Debug + Clone + Serialize + DeserializeOwned
{
    /// Applies an event to the state.
    fn apply(&mut self, event: &Self::Event);

    /// Replaces the state with a recovered one.
    fn update(&mut self, state: Self) {
        *self = state;
    }

    /// Persists an event and, once stored, applies it to the state.
    async fn persist(
        &mut self,
        event: &Self::Event,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        let store = match ctx.get_child::<Store<Self>>("store").await {
            Some(store) => store,
            None => {
                return Err(ActorError::Store(
                    "Can't get store actor".to_string(),
                ));
            }
        };
        let response = store
            .ask(StoreCommand::Persist(event.clone()))
            .await
            .map_err(|e| ActorError::Store(e.to_string()))?;
        match response {
            StoreResponse::Persisted => {
                self.apply(event);
                Ok(())
            }
            StoreResponse::Error(e) => Err(ActorError::Store(e.to_string())),
            _ => Err(ActorError::Store("Can't persist event".to_string())),
        }
    }

    /// Stores a snapshot of the current state.
    async fn snapshot(
        &self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        let store = match ctx.get_child::<Store<Self>>("store").await {
            Some(store) => store,
            None => {
                return Err(ActorError::Store(
                    "Can't get store actor".to_string(),
                ));
            }
        };
        store
            .ask(StoreCommand::Snapshot(self.clone()))
            .await
            .map_err(|e| ActorError::Store(e.to_string()))?;
        Ok(())
    }

    /// Creates the store child and recovers the state from storage. The
    /// current value of `self` is the base used when nothing was stored
    /// yet. The collection prefix defaults to the actor's path key.
    async fn start_store(
        &mut self,
        name: &str,
        prefix: Option<String>,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        let manager: Arc<dyn DbManager> = ctx
            .system()
            .get_helper(STORE_MANAGER)
            .await
            .ok_or_else(|| {
                ActorError::Store("No store manager registered".to_string())
            })?;
        let prefix = match prefix {
            Some(prefix) => prefix,
            None => ctx.path().key(),
        };
        let store = Store::<Self>::new(name, &prefix, manager.as_ref())
            .map_err(|e| ActorError::Store(e.to_string()))?;
        let store = ctx.create_child("store", store).await?;
        let response = store.ask(StoreCommand::Recover(self.clone())).await?;
        match response {
            StoreResponse::Recovered(state) => {
                self.update(state);
                Ok(())
            }
            StoreResponse::Error(e) => Err(ActorError::Store(e.to_string())),
            _ => Err(ActorError::Store("Can't recover state".to_string())),
        }
    }

    /// Flushes a final snapshot and stops the store child.
    async fn stop_store(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        if let Some(store) = ctx.get_child::<Store<Self>>("store").await {
            let _ = store.ask(StoreCommand::Snapshot(self.clone())).await?;
            store.ask_stop().await?;
            Ok(())
        } else {
            Err(ActorError::Store("Can't get store".to_string()))
        }
    }

    /// Removes every stored event and snapshot of this actor.
    async fn purge_store(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        if let Some(store) = ctx.get_child::<Store<Self>>("store").await {
            let _ = store.ask(StoreCommand::Purge).await?;
            Ok(())
        } else {
            Err(ActorError::Store("Can't get store".to_string()))
        }
    }
}

/// Commands accepted by the [`Store`] actor.
#[derive(Debug, Clone)]
pub enum StoreCommand<P: PersistentActor> {
    /// Append an event to the journal.
    Persist(P::Event),
    /// Store a snapshot of the given state.
    Snapshot(P),
    /// Recover the state, applying journaled events on top of the last
    /// snapshot (or on top of the given base state).
    Recover(P),
    /// Remove every event and snapshot.
    Purge,
}

impl<P: PersistentActor> Message for StoreCommand<P> {}

/// Responses produced by the [`Store`] actor. Failures are reported as a
/// value so a misbehaving backend does not take the store actor down.
#[derive(Debug, Clone)]
pub enum StoreResponse<P: PersistentActor> {
    Persisted,
    Snapshotted,
    Recovered(P),
    Purged,
    Error(Error),
}

impl<P: PersistentActor> Response for StoreResponse<P> {}

/// Snapshot payload: the state plus the journal position it covers.
#[derive(Serialize, Deserialize)]
struct SnapshotRecord<P> {
    seq: u64,
    state: P,
}

/// Actor owning the journal and snapshot collections of one persistent
/// actor.
pub struct Store<P>
where
    P: PersistentActor,
{
    /// Sequence number of the next journal entry.
    event_counter: u64,
    events: Box<dyn Collection>,
    states: Box<dyn Collection>,
    _phantom_actor: PhantomData<P>,
}

/// Journal keys are zero-padded so lexicographic order is numeric order.
fn journal_key(seq: u64) -> String {
    format!("{:020}", seq)
}

impl<P: PersistentActor> Store<P> {
    /// Creates the store for `name`, with its collections under `prefix`.
    pub fn new(
        name: &str,
        prefix: &str,
        manager: &dyn DbManager,
    ) -> Result<Self, Error> {
        let events =
            manager.create_collection(&format!("{}_events", name), prefix)?;
        let states =
            manager.create_collection(&format!("{}_states", name), prefix)?;
        Ok(Self {
            event_counter: 0,
            events,
            states,
            _phantom_actor: PhantomData,
        })
    }

    fn persist(&mut self, event: &P::Event) -> Result<(), Error> {
        let bytes = bincode::serialize(event).map_err(|e| {
            Error::Store(format!("Can't serialize event: {}", e))
        })?;
        self.events.put(&journal_key(self.event_counter), &bytes)?;
        self.event_counter += 1;
        Ok(())
    }

    fn snapshot(&mut self, state: &P) -> Result<(), Error> {
        let record = SnapshotRecord {
            seq: self.event_counter,
            state: state.clone(),
        };
        let bytes = bincode::serialize(&record).map_err(|e| {
            Error::Store(format!("Can't serialize state: {}", e))
        })?;
        self.states.put("snapshot", &bytes)
    }

    fn recover(&mut self, base: P) -> Result<P, Error> {
        // Start from the last snapshot when there is one.
        let (mut state, mut seq) = match self.states.get("snapshot") {
            Ok(bytes) => {
                let record: SnapshotRecord<P> = bincode::deserialize(&bytes)
                    .map_err(|e| {
                    Error::Store(format!("Can't deserialize state: {}", e))
                })?;
                (record.state, record.seq)
            }
            Err(Error::EntryNotFound) => (base, 0),
            Err(e) => return Err(e),
        };
        // Replay the journal tail. Every journal key is greater than the
        // empty string, so `after("")` yields the whole journal.
        let tail = if seq == 0 {
            self.events.after("")
        } else {
            self.events.after(&journal_key(seq - 1))
        };
        for (key, bytes) in tail {
            let event: P::Event = bincode::deserialize(&bytes).map_err(|e| {
                Error::Store(format!("Can't deserialize event: {}", e))
            })?;
            state.apply(&event);
            seq = key
                .parse::<u64>()
                .map_err(|e| {
                    Error::Store(format!("Can't parse event key: {}", e))
                })?
                .saturating_add(1);
        }
        self.event_counter = seq;
        Ok(state)
    }

    fn purge(&mut self) -> Result<(), Error> {
        self.events.purge()?;
        self.states.purge()?;
        self.event_counter = 0;
        Ok(())
    }
}

#[async_trait]
impl<P: PersistentActor> Actor for Store<P> {
    type Message = StoreCommand<P>;
    type Response = StoreResponse<P>;
    type Event = ();
}

#[async_trait]
impl<P: PersistentActor> Handler<Store<P>> for Store<P> {
    async fn handle_message(
        &mut self,
        _sender: ActorPath,
        msg: StoreCommand<P>,
        _ctx: &mut ActorContext<Store<P>>,
    ) -> Result<StoreResponse<P>, ActorError> {
        match msg {
            StoreCommand::Persist(event) => match self.persist(&event) {
                Ok(_) => Ok(StoreResponse::Persisted),
                Err(e) => {
                    error!("Can't persist event: {}", e);
                    Ok(StoreResponse::Error(e))
                }
            },
            StoreCommand::Snapshot(state) => match self.snapshot(&state) {
                Ok(_) => Ok(StoreResponse::Snapshotted),
                Err(e) => {
                    error!("Can't snapshot state: {}", e);
                    Ok(StoreResponse::Error(e))
                }
            },
            StoreCommand::Recover(base) => match self.recover(base) {
                Ok(state) => {
                    debug!("Recovered state at seq {}.", self.event_counter);
                    Ok(StoreResponse::Recovered(state))
                }
                Err(e) => {
                    error!("Can't recover state: {}", e);
                    Ok(StoreResponse::Error(e))
                }
            },
            StoreCommand::Purge => match self.purge() {
                Ok(_) => Ok(StoreResponse::Purged),
                Err(e) => Ok(StoreResponse::Error(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::memory::MemoryManager;

    use actor::{ActorSystem, Event};
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposited(u64);

    impl Event for Deposited {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Wallet {
        balance: u64,
    }

    #[derive(Debug, Clone)]
    enum WalletCommand {
        Deposit(u64),
        Balance,
    }

    impl Message for WalletCommand {}

    #[async_trait]
    impl Actor for Wallet {
        type Message = WalletCommand;
        type Response = u64;
        type Event = Deposited;

        async fn pre_start(
            &mut self,
            ctx: &mut ActorContext<Self>,
        ) -> Result<(), ActorError> {
            self.start_store("wallet", None, ctx).await
        }

        async fn pre_stop(
            &mut self,
            ctx: &mut ActorContext<Self>,
        ) -> Result<(), ActorError> {
            self.stop_store(ctx).await
        }
    }

    #[async_trait]
    impl PersistentActor for Wallet {
        fn apply(&mut self, event: &Deposited) {
            self.balance += event.0;
        }
    }

    #[async_trait]
    impl Handler<Wallet> for Wallet {
        async fn handle_message(
            &mut self,
            _sender: ActorPath,
            msg: WalletCommand,
            ctx: &mut ActorContext<Wallet>,
        ) -> Result<u64, ActorError> {
            match msg {
                WalletCommand::Deposit(amount) => {
                    self.persist(&Deposited(amount), ctx).await?;
                    Ok(self.balance)
                }
                WalletCommand::Balance => Ok(self.balance),
            }
        }
    }

    #[tokio::test]
    async fn test_persist_and_recover() {
        let (system, _runner) = ActorSystem::create(CancellationToken::new());
        let manager: Arc<dyn DbManager> =
            Arc::new(MemoryManager::default());
        system.add_helper(STORE_MANAGER, manager).await;

        let wallet_ref = system
            .create_root_actor("wallet-7", Wallet { balance: 0 })
            .await
            .unwrap();
        assert_eq!(
            wallet_ref.ask(WalletCommand::Deposit(5)).await.unwrap(),
            5
        );
        assert_eq!(
            wallet_ref.ask(WalletCommand::Deposit(7)).await.unwrap(),
            12
        );
        wallet_ref.ask_stop().await.unwrap();

        // A new incarnation at the same path recovers the flushed state.
        let wallet_ref = system
            .create_root_actor("wallet-7", Wallet { balance: 0 })
            .await
            .unwrap();
        assert_eq!(
            wallet_ref.ask(WalletCommand::Balance).await.unwrap(),
            12
        );
    }

    #[tokio::test]
    async fn test_recover_replays_journal_tail_after_snapshot() {
        let manager = MemoryManager::default();
        let mut store: Store<Wallet> =
            Store::new("wallet", "w1", &manager).unwrap();

        store.persist(&Deposited(1)).unwrap();
        store.persist(&Deposited(2)).unwrap();
        store.snapshot(&Wallet { balance: 3 }).unwrap();
        store.persist(&Deposited(10)).unwrap();

        let recovered =
            store.recover(Wallet { balance: 0 }).unwrap();
        assert_eq!(recovered.balance, 13);
    }

    #[tokio::test]
    async fn test_recover_without_snapshot_uses_base() {
        let manager = MemoryManager::default();
        let mut store: Store<Wallet> =
            Store::new("wallet", "w2", &manager).unwrap();

        store.persist(&Deposited(4)).unwrap();
        let recovered =
            store.recover(Wallet { balance: 1 }).unwrap();
        assert_eq!(recovered.balance, 5);
        assert_eq!(store.event_counter, 1);
    }

    #[tokio::test]
    async fn test_purge_forgets_everything() {
        let manager = MemoryManager::default();
        let mut store: Store<Wallet> =
            Store::new("wallet", "w3", &manager).unwrap();

        store.persist(&Deposited(4)).unwrap();
        store.snapshot(&Wallet { balance: 4 }).unwrap();
        store.purge().unwrap();

        let recovered =
            store.recover(Wallet { balance: 0 }).unwrap();
        assert_eq!(recovered.balance, 0);
    }
}
