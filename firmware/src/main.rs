//! Scan-timing firmware for a rotating-mirror laser projector on an
//! ATmega328P at 16 MHz (Arduino Uno class boards).
//!
//! Hardware:
//! - Timer1 free-running at 2 MHz as the tick clock
//! - Revolution sensor on PD2 (INT0)
//! - Laser lines on PB0/PB1, status LED on PB5
//! - Calibration buttons on PD4..PD6
//! - Diagnostics on USART0, 57600 baud

#![no_std]
#![no_main]
#![feature(abi_avr_interrupt)]
#![feature(asm_experimental_arch)]

mod board;
mod buttons;
mod clock;
mod eeprom;
mod indicator;
mod sensor;
mod serial;

use avr_device::atmega328p::Peripherals;
use log::{error, info, LevelFilter};
use projector_core::clock::ticks_to_micros;
use projector_core::frame::draw_test_card;
use projector_core::{
    ButtonDebouncer, ButtonLatch, CalibrationTable, ClockedStorage, FrameBuffer, RigConfig,
    ScanEngine, ScanIo,
};

use board::Board;
use eeprom::Eeprom;

/// Room for two planes of the reference rig.
const FRAME_BYTES: usize = 128;

/// Lasers off, then stop.
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    let dp = unsafe { Peripherals::steal() };
    // Nothing may touch PORTB after this.
    clock::disable_compare_interrupts(&dp);
    board::lasers_off(&dp);
    loop {}
}

#[no_mangle]
pub extern "C" fn main() -> ! {
    let dp = unsafe { Peripherals::steal() };

    serial::init(&dp.USART0);
    serial::install_logger(LevelFilter::Info);

    clock::init(&dp.TC1);
    board::init(&dp);
    buttons::init(&dp.PORTD);
    indicator::init(&dp);

    let config = RigConfig::reference();
    sensor::init(&dp, config.debounce);

    unsafe { avr_device::interrupt::enable() };

    // A full table save runs past a Timer1 overflow.
    let mut storage = ClockedStorage::new(Eeprom::new(&dp.EEPROM), || {
        clock::now_main(&dp.TC1);
    });
    let calibration =
        CalibrationTable::load(&mut storage, config.facet_count(), config.default_offset);

    let mut engine = match ScanEngine::new(config, calibration) {
        Ok(engine) => engine,
        Err(err) => {
            error!("rig config rejected: {}", err);
            fault(&dp);
        }
    };
    if engine.calibration().needs_write() {
        engine.calibration_mut().store(&mut storage);
    }

    let mut frame: FrameBuffer<FRAME_BYTES> = match FrameBuffer::for_rig(engine.config()) {
        Ok(frame) => frame,
        Err(err) => {
            error!("frame buffer: {}", err);
            fault(&dp);
        }
    };
    let _ = draw_test_card(&mut frame, "SCAN");

    let mut board = Board::new(&dp);
    engine.measure_delays(&mut board, &frame);
    info!("seeking sync");

    let mut contacts = ButtonDebouncer::new(buttons::SETTLE);
    let mut latch = ButtonLatch::new();

    loop {
        // Also keeps the clock's wrap count current while seeking.
        let now = board.now();
        let levels = contacts.update(buttons::read(&dp.PORTD), now);
        let edges = latch.update(levels);
        engine.step(&mut board, &frame, &mut storage, edges);
    }
}

/// Unusable configuration: keep the lasers dark and blink.
fn fault(dp: &Peripherals) -> ! {
    board::lasers_off(dp);
    let now = clock::now_main(&dp.TC1);
    indicator::blink_forever(dp, ticks_to_micros(now));
    loop {
        clock::now_main(&dp.TC1);
    }
}
