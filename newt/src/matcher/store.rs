use std::collections::BTreeMap;

use crate::exchange::{Exchange, ExchangeId};
use crate::time::Clock;

/// Arena owning every live exchange
#[derive(Debug)]
pub(crate) struct Store<C: Clock> {
  exchanges: BTreeMap<ExchangeId, Exchange<C>>,
  next: u64,
}

impl<C: Clock> Default for Store<C> {
  fn default() -> Self {
    Self { exchanges: BTreeMap::new(),
           next: 1 }
  }
}

impl<C: Clock> Store<C> {
  /// Allocate an id and store the exchange built for it
  pub(crate) fn insert(&mut self, f: impl FnOnce(ExchangeId) -> Exchange<C>) -> ExchangeId {
    let id = ExchangeId(self.next);
    self.next += 1;
    self.exchanges.insert(id, f(id));
    id
  }

  pub(crate) fn get(&self, id: ExchangeId) -> Option<&Exchange<C>> {
    self.exchanges.get(&id)
  }

  pub(crate) fn get_mut(&mut self, id: ExchangeId) -> Option<&mut Exchange<C>> {
    self.exchanges.get_mut(&id)
  }

  pub(crate) fn remove(&mut self, id: ExchangeId) -> Option<Exchange<C>> {
    self.exchanges.remove(&id)
  }

  pub(crate) fn len(&self) -> usize {
    self.exchanges.len()
  }

  pub(crate) fn ids(&self) -> Vec<ExchangeId> {
    self.exchanges.keys().copied().collect()
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = &Exchange<C>> {
    self.exchanges.values()
  }
}
