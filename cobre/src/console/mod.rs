use core::fmt::{write, Arguments, Result, Write};

use crate::sync::SpinLock;

/// Where console output ultimately goes. The actual device (serial port,
/// terminal, ...) lives outside the core and registers itself at boot.
pub trait ConsoleSink: Sync {
	fn write_str(&self, string: &str);
}

struct Console {
	sink: Option<&'static dyn ConsoleSink>,
}

impl Console {
	const fn new() -> Self {
		Self { sink: None }
	}
}

impl Write for Console {
	fn write_str(&mut self, string: &str) -> Result {
		match self.sink {
			Some(sink) => sink.write_str(string),

			// if there's no sink registered yet, there's nowhere to put the
			// output. however, we don't consider this to be an error; it
			// simply goes nowhere.
			None => {},
		}

		Ok(())
	}
}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console::new());

/// Registers the device console output is forwarded to.
pub fn set_sink(sink: &'static dyn ConsoleSink) {
	CONSOLE.lock().sink = Some(sink);
}

#[macro_export]
macro_rules! kprint {
	($($arg:tt)*) => {{
		$crate::console::kprint_args(::core::format_args!($($arg)*)).unwrap();
	}};
}

#[macro_export]
macro_rules! kprintln {
	() => {
		$crate::kprint!("\n")
	};
	($($arg:tt)*) => {{
		$crate::console::kprint_args(::core::format_args!(
			"{}\n",
			::core::format_args!($($arg)*)
		))
		.unwrap();
	}};
}

pub fn kprint_args(args: Arguments) -> Result {
	let mut console = CONSOLE.lock();
	write(&mut *console, args)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	struct Capture(Mutex<String>);

	impl ConsoleSink for Capture {
		fn write_str(&self, string: &str) {
			self.0.lock().unwrap().push_str(string);
		}
	}

	#[test]
	fn output_reaches_the_registered_sink() {
		let capture: &'static Capture = Box::leak(Box::new(Capture(Mutex::new(String::new()))));
		set_sink(capture);

		kprintln!("hello {}", 42);

		assert!(capture.0.lock().unwrap().contains("hello 42\n"));
	}
}
