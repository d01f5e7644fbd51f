//! `log` output on USART0 at 57600 baud.
//!
//! Records are formatted into a ring buffer and drained by the
//! data-register-empty interrupt, so logging never stalls a scan. Bytes
//! that do not fit are dropped.

use core::cell::RefCell;
use core::fmt::{self, Write};

use avr_device::atmega328p::{Peripherals, USART0};
use critical_section::Mutex;
use heapless::Deque;
use log::{LevelFilter, Log, Metadata, Record};

/// 16 MHz / (8 * 57600) - 1, double speed.
const UBRR_57600: u16 = 34;
const U2X0: u8 = 1 << 1;
const TXEN0: u8 = 1 << 3;
const UDRIE0: u8 = 1 << 5;
/// Asynchronous, 8 data bits, no parity, one stop bit.
const FRAME_8N1: u8 = 0b0000_0110;

static TX: Mutex<RefCell<Deque<u8, 128>>> = Mutex::new(RefCell::new(Deque::new()));

static LOGGER: SerialLogger = SerialLogger;

pub fn init(usart: &USART0) {
    usart.ubrr0.write(|w| unsafe { w.bits(UBRR_57600) });
    usart.ucsr0a.write(|w| unsafe { w.bits(U2X0) });
    usart.ucsr0c.write(|w| unsafe { w.bits(FRAME_8N1) });
    usart.ucsr0b.write(|w| unsafe { w.bits(TXEN0) });
}

/// Must run before interrupts are enabled: AVR has no atomic
/// compare-and-swap for the regular setter.
pub fn install_logger(level: LevelFilter) {
    unsafe {
        let _ = log::set_logger_racy(&LOGGER);
        log::set_max_level_racy(level);
    }
}

struct TxQueue;

impl Write for TxQueue {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let dp = unsafe { Peripherals::steal() };
        critical_section::with(|cs| {
            let mut tx = TX.borrow_ref_mut(cs);
            for &byte in s.as_bytes() {
                if tx.push_back(byte).is_err() {
                    break;
                }
            }
            dp.USART0
                .ucsr0b
                .modify(|r, w| unsafe { w.bits(r.bits() | UDRIE0) });
        });
        Ok(())
    }
}

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = write!(TxQueue, "{} {}\r\n", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

#[avr_device::interrupt(atmega328p)]
fn USART_UDRE() {
    let dp = unsafe { Peripherals::steal() };
    critical_section::with(|cs| match TX.borrow_ref_mut(cs).pop_front() {
        Some(byte) => dp.USART0.udr0.write(|w| unsafe { w.bits(byte) }),
        None => dp
            .USART0
            .ucsr0b
            .modify(|r, w| unsafe { w.bits(r.bits() & !UDRIE0) }),
    });
}
