use core::fmt::Write;

static PRINT_IMPL: spin::once::Once<&'static dyn Console> = spin::once::Once::new();

macro_rules! println {
    ($($arg:tt)*) => {{ use core::fmt::Write; let _ = core::writeln!($crate::println::DebugWriter, $($arg)*); }}
}

/// Byte sink behind `println!` and the `log` macros
pub trait Console: Sync {
    fn print_byte(&self, byte: u8) -> core::fmt::Result;

    fn print_str(&self, string: &str) -> core::fmt::Result {
        for byte in string.bytes() {
            self.print_byte(byte)?;
        }
        Ok(())
    }
}

/// Route kernel output to `console` and install the logger.
///
/// The first console installed wins; later calls only fail to set the logger.
pub fn init_logger(
    console: &'static dyn Console,
    level: log::LevelFilter,
) -> Result<(), log::SetLoggerError> {
    PRINT_IMPL.call_once(|| console);
    log::set_logger(&DebugWriter).map(|()| log::set_max_level(level))
}

#[cfg(target_arch = "riscv64")]
pub use sbi::{set_debug_console_print, set_legacy_debug_print};

#[cfg(target_arch = "riscv64")]
mod sbi {
    use super::Console;

    const LEVEL_FILTER: log::LevelFilter = log::LevelFilter::Trace;

    #[inline]
    pub fn set_debug_console_print() -> Result<(), log::SetLoggerError> {
        super::init_logger(&DebugConsoleDebugPrint, LEVEL_FILTER)
    }

    #[inline]
    pub fn set_legacy_debug_print() -> Result<(), log::SetLoggerError> {
        super::init_logger(&LegacyDebugPrint, LEVEL_FILTER)
    }

    struct LegacyDebugPrint;

    impl Console for LegacyDebugPrint {
        #[allow(deprecated)]
        fn print_byte(&self, byte: u8) -> core::fmt::Result {
            if sbi_rt::legacy::console_putchar(byte as usize) != 0 {
                Err(core::fmt::Error)
            } else {
                Ok(())
            }
        }
    }

    struct DebugConsoleDebugPrint;

    impl Console for DebugConsoleDebugPrint {
        fn print_byte(&self, byte: u8) -> core::fmt::Result {
            if sbi_rt::console_write_byte(byte).is_ok() {
                Ok(())
            } else {
                Err(core::fmt::Error)
            }
        }

        fn print_str(&self, string: &str) -> core::fmt::Result {
            let string_bytes = string.as_bytes();
            if sbi_rt::console_write(sbi_rt::Physical::new(
                string_bytes.len(),
                string_bytes.as_ptr() as _,
                0,
            ))
            .is_ok()
            {
                Ok(())
            } else {
                Err(core::fmt::Error)
            }
        }
    }
}

pub(crate) struct DebugWriter;

impl Write for DebugWriter {
    fn write_str(&mut self, string: &str) -> core::fmt::Result {
        // Output before a console is installed is dropped
        PRINT_IMPL
            .get()
            .map_or(Ok(()), |console| console.print_str(string))
    }
}

impl log::Log for DebugWriter {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let file = record.file().unwrap_or("");
            let line = record.line().unwrap_or(0);

            println!(
                "[{}] ({}:{}:{}): {}",
                record.level(),
                record.target(),
                file,
                line,
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

pub(crate) use println;
