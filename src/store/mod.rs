//! Minimal reducer runtime.
//!
//! A `Store` task owns the state. Actions are reduced one at a time, every
//! new state is published on a watch channel and the returned `Effect` is run
//! on its own task. Effects feed actions back through an `ActionSender`.

pub mod bluetooth;
pub mod identified;

use std::collections::HashMap;
use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, trace};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

pub type CancelId = &'static str;

pub trait Reducer: Send + 'static {
    type State: Clone + Send + Sync + 'static;
    type Action: Send + 'static;

    fn reduce(
        &self, state: &mut Self::State, action: Self::Action,
    ) -> Effect<Self::Action>;
}

/// Feeds actions back into the store that spawned an effect.
pub struct ActionSender<A> {
    tx: mpsc::UnboundedSender<A>,
}

impl<A> Clone for ActionSender<A> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<A> ActionSender<A> {
    /// Returns false once the store is gone.
    pub fn send(&self, action: A) -> bool {
        self.tx.send(action).is_ok()
    }
}

type Work<A> = Box<dyn FnOnce(ActionSender<A>) -> BoxFuture<'static, ()> + Send>;

enum EffectKind<A> {
    None,
    Run(Work<A>),
    Cancellable(CancelId, Work<A>),
    Cancel(CancelId),
    Merge(Vec<Effect<A>>),
}

/// Side effect returned by a reducer.
pub struct Effect<A> {
    kind: EffectKind<A>,
}

impl<A: Send + 'static> Effect<A> {
    pub fn none() -> Self {
        Self { kind: EffectKind::None }
    }

    pub fn run<F, Fut>(work: F) -> Self
    where
        F: FnOnce(ActionSender<A>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self { kind: EffectKind::Run(Box::new(move |send| work(send).boxed())) }
    }

    /// Tags the effect with `id`: starting it aborts a running effect with
    /// the same id, and `Effect::cancel(id)` aborts it.
    pub fn cancellable(self, id: CancelId) -> Self {
        let kind = match self.kind {
            EffectKind::Run(work) | EffectKind::Cancellable(_, work) => {
                EffectKind::Cancellable(id, work)
            }
            other => other,
        };
        Self { kind }
    }

    pub fn cancel(id: CancelId) -> Self {
        Self { kind: EffectKind::Cancel(id) }
    }

    pub fn merge(effects: Vec<Effect<A>>) -> Self {
        Self { kind: EffectKind::Merge(effects) }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, EffectKind::None)
    }
}

struct EffectRunner<A> {
    send: ActionSender<A>,
    detached: JoinSet<()>,
    cancellable: HashMap<CancelId, JoinHandle<()>>,
}

impl<A: Send + 'static> EffectRunner<A> {
    fn start(&mut self, effect: Effect<A>) {
        match effect.kind {
            EffectKind::None => {}
            EffectKind::Run(work) => {
                self.detached.spawn(work(self.send.clone()));
            }
            EffectKind::Cancellable(id, work) => {
                let task = tokio::spawn(work(self.send.clone()));
                if let Some(previous) = self.cancellable.insert(id, task) {
                    debug!("Effect {} replaced", id);
                    previous.abort();
                }
            }
            EffectKind::Cancel(id) => {
                if let Some(task) = self.cancellable.remove(id) {
                    debug!("Effect {} cancelled", id);
                    task.abort();
                }
            }
            EffectKind::Merge(effects) => {
                for effect in effects {
                    self.start(effect);
                }
            }
        }
    }

    fn stop(&mut self) {
        for (_, task) in self.cancellable.drain() {
            task.abort();
        }
        self.detached.abort_all();
    }
}

pub struct Store<R: Reducer> {
    action_tx: mpsc::UnboundedSender<R::Action>,
    state_rx: watch::Receiver<R::State>,
    _drop_tx: oneshot::Sender<()>,
}

impl<R: Reducer> Store<R> {
    pub fn new(reducer: R, initial: R::State) -> Self {
        let (action_tx, mut action_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let (_drop_tx, mut drop_rx) = oneshot::channel::<()>();

        let send = ActionSender { tx: action_tx.clone() };
        tokio::spawn(async move {
            let mut state = initial;
            let mut effects = EffectRunner {
                send,
                detached: JoinSet::new(),
                cancellable: HashMap::new(),
            };

            loop {
                tokio::select! {
                    _ = &mut drop_rx => {
                        info!("Store task is stopping");
                        break;
                    }
                    Some(action) = action_rx.recv() => {
                        let effect = reducer.reduce(&mut state, action);
                        state_tx.send_replace(state.clone());
                        effects.start(effect);
                    }
                    Some(_) = effects.detached.join_next() => {
                        trace!("Effect finished");
                    }
                }
            }

            effects.stop();
        });

        Self { action_tx, state_rx, _drop_tx }
    }

    pub fn send(&self, action: R::Action) {
        //the task only stops when the store is dropped
        let _ = self.action_tx.send(action);
    }

    pub fn sender(&self) -> ActionSender<R::Action> {
        ActionSender { tx: self.action_tx.clone() }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> R::State {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<R::State> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    enum CounterAction {
        Add(i32),
        AddLater(i32),
        Forever,
        Stop,
    }

    struct Counter;

    impl Reducer for Counter {
        type State = i32;
        type Action = CounterAction;

        fn reduce(&self, state: &mut i32, action: CounterAction) -> Effect<CounterAction> {
            match action {
                CounterAction::Add(n) => {
                    *state += n;
                    Effect::none()
                }
                CounterAction::AddLater(n) => Effect::run(move |send| async move {
                    send.send(CounterAction::Add(n));
                }),
                CounterAction::Forever => Effect::run(|send| async move {
                    loop {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        if !send.send(CounterAction::Add(1)) {
                            break;
                        }
                    }
                })
                .cancellable("forever"),
                CounterAction::Stop => Effect::cancel("forever"),
            }
        }
    }

    #[tokio::test]
    async fn test_effects_feed_actions_back() {
        let store = Store::new(Counter, 0);
        let mut states = store.subscribe();

        store.send(CounterAction::Add(2));
        store.send(CounterAction::AddLater(40));

        assert!(timeout(WAIT, states.wait_for(|n| *n == 42)).await.unwrap().is_ok());
        assert_eq!(store.state(), 42);
    }

    #[tokio::test]
    async fn test_cancel_stops_effect() {
        let store = Store::new(Counter, 0);
        let mut states = store.subscribe();

        store.send(CounterAction::Forever);
        timeout(WAIT, states.wait_for(|n| *n >= 2)).await.unwrap().unwrap();
        store.send(CounterAction::Stop);

        //let the cancellation land, then the count must stay put
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped = store.state();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.state(), stopped);
    }

    #[test]
    fn test_cancellable_wraps_only_work() {
        let effect: Effect<CounterAction> = Effect::none().cancellable("noop");
        assert!(effect.is_none());
    }
}
