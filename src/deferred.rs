//! Settle-once deferred values
//!
//! A [`Deferred`] stands in for a value that is not available yet. It is a
//! minimal, single-threaded promise: callbacks registered with
//! [`Deferred::then`] fire in registration order when the value settles, and
//! a callback that returns another deferred is flattened into the chain.
//!
//! Callbacks attached to an already settled value are never run re-entrantly.
//! They are pushed onto the shared [`Scheduler`] and run by the owner of the
//! scheduler (the executor's drain loop).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

type Job<'a> = Box<dyn FnOnce() + 'a>;
type Callback<'a, T, E> = Box<dyn FnOnce(Result<T, E>) + 'a>;

/// FIFO queue of continuations deferred out of `then` calls on settled values.
pub struct Scheduler<'a> {
    jobs: Rc<RefCell<VecDeque<Job<'a>>>>,
}

impl<'a> Scheduler<'a> {
    pub fn new() -> Self {
        Self {
            jobs: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    fn schedule(&self, job: Job<'a>) {
        self.jobs.borrow_mut().push_back(job);
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.borrow().is_empty()
    }

    /// Run queued jobs until the queue is empty, including jobs scheduled by
    /// the jobs themselves. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the job runs; jobs schedule more jobs.
            let next = self.jobs.borrow_mut().pop_front();
            match next {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Default for Scheduler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Scheduler<'_> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

/// Outcome of a continuation: either a plain value or another deferred value
/// to follow.
pub enum Step<'a, T, E> {
    Ready(T),
    Chain(Deferred<'a, T, E>),
}

impl<T: fmt::Debug, E> fmt::Debug for Step<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Step::Chain(_) => f.write_str("Chain(..)"),
        }
    }
}

/// Current state of a deferred value.
#[derive(Debug, Clone, PartialEq)]
pub enum State<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
}

struct Inner<'a, T, E> {
    state: State<T, E>,
    callbacks: Vec<Callback<'a, T, E>>,
}

/// A value that settles exactly once.
///
/// Settling a value twice is a programming error and panics.
pub struct Deferred<'a, T, E> {
    inner: Rc<RefCell<Inner<'a, T, E>>>,
    scheduler: Scheduler<'a>,
}

impl<T, E> Clone for Deferred<'_, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<'a, T, E> Deferred<'a, T, E>
where
    T: Clone + 'a,
    E: Clone + 'a,
{
    /// Create a pending value bound to `scheduler`.
    pub fn new(scheduler: &Scheduler<'a>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                callbacks: Vec::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    /// Create a value that is already resolved.
    pub fn resolved(scheduler: &Scheduler<'a>, value: T) -> Self {
        let deferred = Self::new(scheduler);
        deferred.resolve(value);
        deferred
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    /// # Panics
    ///
    /// Panics if the value has already settled.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    /// # Panics
    ///
    /// Panics if the value has already settled.
    pub fn reject(&self, error: E) {
        self.settle(Err(error));
    }

    fn settle(&self, outcome: Result<T, E>) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            assert!(
                matches!(inner.state, State::Pending),
                "deferred value settled twice"
            );
            inner.state = match &outcome {
                Ok(value) => State::Resolved(value.clone()),
                Err(error) => State::Rejected(error.clone()),
            };
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(outcome.clone());
        }
    }

    fn subscribe(&self, callback: Callback<'a, T, E>) {
        let mut inner = self.inner.borrow_mut();
        let outcome = match &inner.state {
            State::Pending => {
                inner.callbacks.push(callback);
                return;
            }
            State::Resolved(value) => Ok(value.clone()),
            State::Rejected(error) => Err(error.clone()),
        };
        drop(inner);
        self.scheduler.schedule(Box::new(move || callback(outcome)));
    }

    /// Settle `target` with whatever this value settles to.
    fn forward_to(&self, target: Deferred<'a, T, E>) {
        self.subscribe(Box::new(move |outcome| target.settle(outcome)));
    }

    /// Chain continuations onto this value.
    ///
    /// The returned value settles with the outcome of whichever callback
    /// runs. Returning `Step::Chain` from a callback makes the result follow
    /// that deferred value; returning `Err` rejects it.
    pub fn then<U, R, J>(&self, on_resolve: R, on_reject: J) -> Deferred<'a, U, E>
    where
        U: Clone + 'a,
        R: FnOnce(T) -> Result<Step<'a, U, E>, E> + 'a,
        J: FnOnce(E) -> Result<Step<'a, U, E>, E> + 'a,
    {
        let next = Deferred::new(&self.scheduler);
        let target = next.clone();
        self.subscribe(Box::new(move |outcome| {
            let step = match outcome {
                Ok(value) => on_resolve(value),
                Err(error) => on_reject(error),
            };
            match step {
                Ok(Step::Ready(value)) => target.resolve(value),
                Ok(Step::Chain(deferred)) => deferred.forward_to(target),
                Err(error) => target.reject(error),
            }
        }));
        next
    }

    /// Transform the resolved value; rejections pass through.
    pub fn map<U, F>(&self, f: F) -> Deferred<'a, U, E>
    where
        U: Clone + 'a,
        F: FnOnce(T) -> U + 'a,
    {
        self.then(move |value| Ok(Step::Ready(f(value))), Err)
    }
}

/// Aggregate a list of steps into one deferred list that resolves, in index
/// order, once every item has resolved. The first rejection rejects the
/// aggregate.
pub fn join_all<'a, T, E>(scheduler: &Scheduler<'a>, steps: Vec<Step<'a, T, E>>) -> Deferred<'a, Vec<T>, E>
where
    T: Clone + 'a,
    E: Clone + 'a,
{
    let target = Deferred::new(scheduler);
    let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; steps.len()]));
    let mut waiting = Vec::new();

    for (index, step) in steps.into_iter().enumerate() {
        match step {
            Step::Ready(value) => slots.borrow_mut()[index] = Some(value),
            Step::Chain(deferred) => waiting.push((index, deferred)),
        }
    }

    if waiting.is_empty() {
        target.resolve(collect_slots(&slots));
        return target;
    }

    let remaining = Rc::new(RefCell::new(waiting.len()));
    for (index, deferred) in waiting {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let target = target.clone();
        deferred.subscribe(Box::new(move |outcome| {
            if !target.is_pending() {
                return;
            }
            match outcome {
                Ok(value) => {
                    slots.borrow_mut()[index] = Some(value);
                    let left = {
                        let mut remaining = remaining.borrow_mut();
                        *remaining -= 1;
                        *remaining
                    };
                    if left == 0 {
                        target.resolve(collect_slots(&slots));
                    }
                }
                Err(error) => target.reject(error),
            }
        }));
    }
    target
}

fn collect_slots<T: Clone>(slots: &Rc<RefCell<Vec<Option<T>>>>) -> Vec<T> {
    slots.borrow_mut().drain(..).flatten().collect()
}
