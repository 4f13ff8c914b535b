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

/// The saved local interrupt-delivery state of a single CPU.
///
/// Produced by `disable_and_save_interrupts` and consumed by
/// `restore_interrupts`. The state is meaningful only on the CPU that saved
/// it, which is why the lock guards that carry one are not `Send`.
#[derive(Clone, Copy)]
pub struct InterruptState(pub(super) bool);
