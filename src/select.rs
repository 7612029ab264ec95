//! Weighted selection of the next action a virtual user takes.
//!
//! An [`ActionSelector`] holds a list of actions, each with a weight, and a
//! [`SelectionPolicy`] deciding the order they are handed out in. For example,
//! with action A weighted 3 and action B weighted 2:
//!  - `RoundRobin` repeats A, B, A, B, A;
//!  - `Serial` repeats A, A, A, B, B;
//!  - `Random` picks A with probability 3/5 and B with probability 2/5 on every
//!    call.
//!
//! Random selection draws from the random generator it is given, normally the
//! virtual user's own (see [`VirtualUser::choose`](../user/struct.VirtualUser.html#method.choose)),
//! so a seeded run makes the same choices every time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The order in which weighted actions are selected.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// An independent weighted pick on every call.
    Random,
    /// One of each remaining action at a time (default).
    RoundRobin,
    /// Each action as many times as its weight, in the order defined.
    Serial,
}
impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::RoundRobin
    }
}

/// A weighted set of actions.
///
/// # Example
/// ```rust
/// use skein::select::{ActionSelector, SelectionPolicy};
///
/// let mut browse = ActionSelector::new(SelectionPolicy::Serial)
///     .with("products", 2)
///     .with("cart", 1);
///
/// let mut rng = rand::rng();
/// let picked: Vec<&str> = (0..6).filter_map(|_| browse.select(&mut rng).copied()).collect();
/// assert_eq!(picked, vec!["products", "products", "cart", "products", "products", "cart"]);
/// ```
#[derive(Clone, Debug)]
pub struct ActionSelector<A> {
    actions: Vec<A>,
    weights: Vec<usize>,
    policy: SelectionPolicy,
    // Action indexes for one full pass, for the deterministic policies.
    schedule: Vec<usize>,
    position: usize,
}

impl<A> ActionSelector<A> {
    pub fn new(policy: SelectionPolicy) -> Self {
        ActionSelector {
            actions: Vec::new(),
            weights: Vec::new(),
            policy,
            schedule: Vec::new(),
            position: 0,
        }
    }

    /// Add an action. An action weighted 0 is never selected.
    pub fn with(mut self, action: A, weight: usize) -> Self {
        self.actions.push(action);
        self.weights.push(weight);
        self.schedule = build_schedule(&self.weights, self.policy);
        self.position = 0;
        self
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn actions(&self) -> &[A] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }

    /// The next action, or `None` if no action has a weight above 0.
    pub fn select<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<&A> {
        if self.schedule.is_empty() {
            return None;
        }
        let index = match self.policy {
            SelectionPolicy::Random => self.schedule[rng.random_range(0..self.schedule.len())],
            SelectionPolicy::RoundRobin | SelectionPolicy::Serial => {
                let index = self.schedule[self.position];
                self.position = (self.position + 1) % self.schedule.len();
                index
            }
        };
        self.actions.get(index)
    }
}

fn build_schedule(weights: &[usize], policy: SelectionPolicy) -> Vec<usize> {
    let total: usize = weights.iter().sum();
    let mut schedule = Vec::with_capacity(total);
    match policy {
        SelectionPolicy::RoundRobin => {
            let mut remaining = weights.to_vec();
            while schedule.len() < total {
                for (index, weight) in remaining.iter_mut().enumerate() {
                    if *weight > 0 {
                        *weight -= 1;
                        schedule.push(index);
                    }
                }
            }
        }
        // A random pick over the expanded list is a weighted pick.
        SelectionPolicy::Serial | SelectionPolicy::Random => {
            for (index, weight) in weights.iter().enumerate() {
                schedule.extend(std::iter::repeat(index).take(*weight));
            }
        }
    }
    schedule
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::str::FromStr;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Action {
        ListProducts,
        AddToCart,
        Checkout,
    }

    fn selector(policy: SelectionPolicy) -> ActionSelector<Action> {
        ActionSelector::new(policy)
            .with(Action::ListProducts, 3)
            .with(Action::AddToCart, 2)
            .with(Action::Checkout, 0)
    }

    fn take(selector: &mut ActionSelector<Action>, count: usize, seed: u64) -> Vec<Action> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .filter_map(|_| selector.select(&mut rng).copied())
            .collect()
    }

    #[test]
    fn round_robin() {
        use Action::*;
        assert_eq!(
            take(&mut selector(SelectionPolicy::RoundRobin), 7, 0),
            vec![ListProducts, AddToCart, ListProducts, AddToCart, ListProducts, ListProducts, AddToCart]
        );
    }

    #[test]
    fn serial() {
        use Action::*;
        assert_eq!(
            take(&mut selector(SelectionPolicy::Serial), 6, 0),
            vec![ListProducts, ListProducts, ListProducts, AddToCart, AddToCart, ListProducts]
        );
    }

    #[test]
    fn random_is_weighted_and_seeded() {
        let picks = take(&mut selector(SelectionPolicy::Random), 5_000, 7);
        assert!(!picks.contains(&Action::Checkout));
        let products = picks.iter().filter(|a| **a == Action::ListProducts).count();
        // Expect 3/5 of the picks.
        assert!(products > 2_700 && products < 3_300, "{}", products);

        assert_eq!(
            take(&mut selector(SelectionPolicy::Random), 50, 11),
            take(&mut selector(SelectionPolicy::Random), 50, 11)
        );
    }

    #[test]
    fn empty() {
        let mut none: ActionSelector<Action> =
            ActionSelector::new(SelectionPolicy::Random).with(Action::Checkout, 0);
        assert!(none.is_empty());
        assert!(take(&mut none, 3, 0).is_empty());
        assert_eq!(
            SelectionPolicy::from_str("round-robin").unwrap(),
            SelectionPolicy::RoundRobin
        );
    }
}
