/*
 * This file is part of Cinabrio OS
 * Copyright (C) 2026 Cinabrio OS Developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Lesser General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU Lesser General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::{
	cell::UnsafeCell,
	hint::spin_loop,
	marker::PhantomData,
	ops::{Deref, DerefMut},
	sync::atomic::{AtomicUsize, Ordering},
};

use crate::interrupts::{self, restore_interrupts, InterruptState};

const WRITER_ACTIVE: usize = 1 << (usize::BITS - 1);
const WRITER_WAITING: usize = 1 << (usize::BITS - 2);

/// An interrupt-safe reader/writer spin lock.
///
/// Many readers or one writer. A waiting writer blocks new readers from
/// entering, so a steady stream of readers cannot starve it; the readers
/// already inside drain out and the writer gets its turn.
///
/// The whole state is one word: a reader count in the low bits plus a
/// writer-waiting and a writer-active bit up top.
pub struct RwLock<T: ?Sized> {
	state: AtomicUsize,
	data: UnsafeCell<T>,
}

pub struct RwLockReadGuard<'a, T: ?Sized + 'a> {
	lock: &'a RwLock<T>,
	interrupt_state: InterruptState,
	// carries this CPU's saved interrupt state; see SpinLockGuard
	_not_send: PhantomData<*const ()>,
}

pub struct RwLockWriteGuard<'a, T: ?Sized + 'a> {
	lock: &'a RwLock<T>,
	interrupt_state: InterruptState,
	_not_send: PhantomData<*const ()>,
}

impl<T> RwLock<T> {
	pub const fn new(data: T) -> Self {
		Self {
			state: AtomicUsize::new(0),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> RwLock<T> {
	pub fn read(&self) -> RwLockReadGuard<'_, T> {
		loop {
			let interrupt_state = interrupts::disable_and_save_interrupts();
			let current = self.state.load(Ordering::Relaxed);

			// readers stay out while a writer is active *or* waiting
			if current & (WRITER_ACTIVE | WRITER_WAITING) == 0 {
				if self
					.state
					.compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
					.is_ok()
				{
					return RwLockReadGuard {
						lock: self,
						interrupt_state,
						_not_send: PhantomData,
					};
				}
			}

			// SAFETY: we're only undoing the save we just made; no references were taken.
			unsafe { restore_interrupts(interrupt_state) };
			spin_loop();
		}
	}

	pub fn write(&self) -> RwLockWriteGuard<'_, T> {
		// claim the waiting slot first so no new readers get in
		let interrupt_state = loop {
			let interrupt_state = interrupts::disable_and_save_interrupts();
			let current = self.state.load(Ordering::Relaxed);

			if current & (WRITER_ACTIVE | WRITER_WAITING) == 0 {
				if self
					.state
					.compare_exchange_weak(
						current,
						current | WRITER_WAITING,
						Ordering::Acquire,
						Ordering::Relaxed,
					)
					.is_ok()
				{
					break interrupt_state;
				}
			}

			// SAFETY: same as in read().
			unsafe { restore_interrupts(interrupt_state) };
			spin_loop();
		};

		// now wait for the readers that beat us in to drain out
		loop {
			if self
				.state
				.compare_exchange_weak(WRITER_WAITING, WRITER_ACTIVE, Ordering::Acquire, Ordering::Relaxed)
				.is_ok()
			{
				return RwLockWriteGuard {
					lock: self,
					interrupt_state,
					_not_send: PhantomData,
				};
			}
			spin_loop();
		}
	}
}

impl<'a, T: ?Sized> Drop for RwLockReadGuard<'a, T> {
	fn drop(&mut self) {
		self.lock.state.fetch_sub(1, Ordering::Release);

		// SAFETY: restoring the state this guard saved on this same CPU.
		unsafe { restore_interrupts(self.interrupt_state) };
	}
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
	fn drop(&mut self) {
		// no reader can have entered and no other writer can have registered
		// while we were active, so the state is exactly WRITER_ACTIVE
		self.lock.state.store(0, Ordering::Release);

		// SAFETY: restoring the state this guard saved on this same CPU.
		unsafe { restore_interrupts(self.interrupt_state) };
	}
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: the reader count keeps writers out for as long as this guard lives.
		unsafe { &*self.lock.data.get() }
	}
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: the writer-active bit gives this guard exclusive access.
		unsafe { &*self.lock.data.get() }
	}
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		// SAFETY: same as the Deref::deref implementation
		unsafe { &mut *self.lock.data.get() }
	}
}

// SAFETY: readers only ever share &T and the single writer gets &mut T, which
//         is the usual reader/writer contract.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

// SAFETY: a live guard means the matching mode is still engaged, so sharing
//         one never outlives its access rights.
unsafe impl<'a, T: ?Sized + Sync> Sync for RwLockReadGuard<'a, T> {}
unsafe impl<'a, T: ?Sized + Sync> Sync for RwLockWriteGuard<'a, T> {}

impl<T: ?Sized + Default> Default for RwLock<T> {
	fn default() -> Self {
		Self::new(Default::default())
	}
}
