use std::sync::Arc;

use toad_stem::Stem;

/// A list of listeners that may be added to & removed from
/// while it is being iterated.
///
/// Iteration works on a snapshot taken when it starts; listeners
/// added during it are seen next time, removed ones still get
/// the current call.
pub(crate) struct Registry<T: ?Sized>(Stem<Vec<Arc<T>>>);

impl<T: ?Sized> Default for Registry<T> {
  fn default() -> Self {
    Self(Stem::new(Vec::new()))
  }
}

impl<T: ?Sized> core::fmt::Debug for Registry<T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "Registry({} listener(s))", self.len())
  }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
  Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<T: ?Sized> Registry<T> {
  /// Add a listener. Adding one that is already present does nothing.
  pub(crate) fn add(&self, item: Arc<T>) {
    self.0.map_mut(|items| {
            if !items.iter().any(|i| same(i, &item)) {
              items.push(item.clone());
            }
          })
  }

  /// Remove a listener, yielding whether it was present
  pub(crate) fn remove(&self, item: &Arc<T>) -> bool {
    self.0.map_mut(|items| {
            let before = items.len();
            items.retain(|i| !same(i, item));
            items.len() != before
          })
  }

  pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
    self.0.map_ref(|items| items.clone())
  }

  pub(crate) fn len(&self) -> usize {
    self.0.map_ref(|items| items.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  trait Named: Send + Sync {
    fn name(&self) -> &'static str;
  }

  struct A;
  impl Named for A {
    fn name(&self) -> &'static str {
      "a"
    }
  }

  #[test]
  fn add_remove() {
    let reg = Registry::<dyn Named>::default();
    let a: Arc<dyn Named> = Arc::new(A);
    let b: Arc<dyn Named> = Arc::new(A);

    reg.add(a.clone());
    reg.add(a.clone());
    reg.add(b.clone());
    assert_eq!(reg.len(), 2);

    assert!(reg.remove(&a));
    assert!(!reg.remove(&a));
    assert_eq!(reg.snapshot().iter().map(|n| n.name()).collect::<Vec<_>>(),
               vec!["a"]);
  }

  #[test]
  fn snapshot_is_stable_while_registry_changes() {
    let reg = Registry::<dyn Named>::default();
    let a: Arc<dyn Named> = Arc::new(A);
    reg.add(a.clone());

    let snap = reg.snapshot();
    reg.remove(&a);
    reg.add(Arc::new(A));
    reg.add(Arc::new(A));

    assert_eq!(snap.len(), 1);
    assert_eq!(reg.len(), 2);
  }
}
