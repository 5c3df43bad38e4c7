// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![deny(dead_code, unused_imports)]

/// Something that performs a final action when it is dropped without being countered.
///
/// Used to undo partially-applied state when a future holding the guard is cancelled.
pub trait DropkickSync {
  fn dropkick(self);
}

/// A wrapper-type which [DropkickSync::dropkick]s its contents unless `counter`ed
#[derive(Debug)]
#[repr(transparent)]
pub struct Dropkick<T: DropkickSync> {
  inner: Option<T>,
}

impl<T> Dropkick<T>
where
  T: DropkickSync,
{
  pub fn new(target: T) -> Self {
    Self {
      inner: Some(target),
    }
  }

  /// Consumes the guard without kicking, handing back its content
  pub fn counter_take(mut self) -> Option<T> {
    self.inner.take()
  }

  pub fn get(&self) -> Option<&T> {
    self.inner.as_ref()
  }
}

impl<T> Drop for Dropkick<T>
where
  T: DropkickSync,
{
  fn drop(&mut self) {
    if let Some(inner) = self.inner.take() {
      DropkickSync::dropkick(inner);
    }
  }
}

/// Cancels a [tokio_util::sync::CancellationToken] when dropkicked
impl DropkickSync for ::tokio_util::sync::CancellationToken {
  fn dropkick(self) {
    self.cancel();
  }
}

impl<F> DropkickSync for F
where
  F: FnOnce(),
{
  fn dropkick(self) {
    (self)();
  }
}
