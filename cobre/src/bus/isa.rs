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

use crate::interrupts::{IrqTuple, Polarity, TriggerMode};
use crate::sync::SpinLock;

pub const ISA_LINES: usize = 16;

// ISA lines map 1:1 onto GSI numbers, active high and edge triggered, until
// a firmware override says otherwise
const fn default_lines() -> [IrqTuple; ISA_LINES] {
	let mut lines = [IrqTuple {
		irq: 0,
		polarity: Polarity::High,
		trigger: TriggerMode::Edge,
	}; ISA_LINES];

	let mut line = 0;
	while line < ISA_LINES {
		lines[line].irq = line as u32;
		line += 1;
	}

	lines
}

static ISA_IRQS: SpinLock<[IrqTuple; ISA_LINES]> = SpinLock::new(default_lines());

/// The routing tuple for one ISA line.
///
/// Panics on an out-of-range line; asking for a line the bus doesn't have is
/// a programming error.
pub fn irq_tuple(line: usize) -> IrqTuple {
	if line >= ISA_LINES {
		panic!("invalid ISA interrupt line {}", line);
	}

	ISA_IRQS.lock()[line]
}

/// Applies a firmware interrupt source override. Overrides must be in place
/// before any driver routes the line.
pub fn apply_override(line: usize, tuple: IrqTuple) {
	if line >= ISA_LINES {
		panic!("invalid ISA interrupt line {}", line);
	}

	ISA_IRQS.lock()[line] = tuple;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lines_default_to_identity_high_edge() {
		let tuple = irq_tuple(4);
		assert_eq!(
			tuple,
			IrqTuple {
				irq: 4,
				polarity: Polarity::High,
				trigger: TriggerMode::Edge,
			}
		);
	}

	#[test]
	fn overrides_replace_the_default() {
		// the classic firmware quirk: ISA line 9 rerouted to GSI 20,
		// level-triggered and active low
		apply_override(
			9,
			IrqTuple {
				irq: 20,
				polarity: Polarity::Low,
				trigger: TriggerMode::Level,
			},
		);

		let tuple = irq_tuple(9);
		assert_eq!(tuple.irq, 20);
		assert_eq!(tuple.polarity, Polarity::Low);
		assert_eq!(tuple.trigger, TriggerMode::Level);
	}

	#[test]
	#[should_panic(expected = "invalid ISA interrupt line 16")]
	fn out_of_range_lines_panic() {
		irq_tuple(ISA_LINES);
	}
}
