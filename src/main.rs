#![no_std]
#![no_main]

use panic_halt as _;

use rtic::app;

use cortex_m::asm::{delay, wfi};

use stm32f1xx_hal::{
    prelude::*,
    pac::{RCC, USB},
    pac,
    gpio::{Floating, Input, gpioa::{PA11, PA12}},
    timer::{Timer, CountDownTimer, Event},
};
#[cfg(feature = "debug-log")]
use stm32f1xx_hal::serial::Serial;
use embedded_hal::digital::v2::OutputPin;

use heapless::spsc::Queue;
use keyboot_core::{
    config::{USB_PID, USB_VID},
    handoff,
    image::image_is_valid,
    transport::{EventConsumer, EventQueue, SharedStatus},
    decide, Decision, FlashRegion, Resident,
};

use stm32_usbd::{UsbBus, UsbPeripheral};
use usb_device::{
    prelude::*,
    bus,
};

#[macro_use]
mod util;
mod backup;
mod board;
mod config;
mod dfu;
mod flash;

use crate::board::{Stm32Board, TICKS};
use crate::dfu::Dfu;

/// Flash engine status, written by `idle` and read by the DFU class.
static ENGINE: SharedStatus = SharedStatus::new();

pub struct Peripheral {
    pub usb: USB,
    pub pin_dm: PA11<Input<Floating>>,
    pub pin_dp: PA12<Input<Floating>>,
}

unsafe impl Sync for Peripheral {}

unsafe impl UsbPeripheral for Peripheral {
    const REGISTERS: *const () = USB::ptr() as *const ();
    const DP_PULL_UP_FEATURE: bool = true;
    const EP_MEMORY: *const () = 0x4000_6000 as _;
    const EP_MEMORY_SIZE: usize = 512;

    fn enable() {
        let rcc = unsafe { &*RCC::ptr() };

        cortex_m::interrupt::free(|_| {
            // Enable USB peripheral
            rcc.apb1enr.modify(|_, w| w.usben().set_bit());

            // Reset USB peripheral
            rcc.apb1rstr.modify(|_, w| w.usbrst().set_bit());
            rcc.apb1rstr.modify(|_, w| w.usbrst().clear_bit());
        });
    }

    fn startup_delay() {
        // There is a chip specific startup delay. For STM32F103xx it's 1µs and this should wait for
        // at least that long.
        delay(72);
    }
}

pub type UsbBusType = UsbBus<Peripheral>;

/// Leave for the application, or stay if the image turns out unusable.
fn leave(board: &mut Stm32Board, region: &FlashRegion) {
    match handoff::prepare(board, &config::BOARD, region) {
        Ok(target) => unsafe { util::jump_to_usercode(&target) },
        Err(e) => log!("Handoff refused: {}\r\n", e),
    }
}

#[app(device = stm32f1xx_hal::pac, peripherals = true)]
const APP: () = {
    struct Resources {
        USB_DEV: UsbDevice<'static, UsbBusType>,
        DFU: Dfu<'static, UsbBusType>,
        TIMER_HANDLE: CountDownTimer<pac::TIM2>,
        BOARD: Stm32Board,
        REGION: FlashRegion,
        RESIDENT: Resident<'static>,
        EVENTS: EventConsumer<'static>,
    }

    #[init]
    fn init(cx: init::Context) -> init::LateResources {
        static mut USB_BUS: Option<bus::UsbBusAllocator<UsbBusType>> = None;
        static mut QUEUE: EventQueue = Queue::new();
        let device: pac::Peripherals = cx.device;

        let mut flash = device.FLASH.constrain();
        let mut rcc = device.RCC.constrain();

        let clocks = rcc.cfgr
            .use_hse(8.mhz())
            .sysclk(48.mhz())
            .pclk1(24.mhz())
            .freeze(&mut flash.acr);

        let board_config = config::BOARD;
        let region = FlashRegion::for_flash_size(flash::flash_size_kib());
        let mut board = Stm32Board::new(clocks.sysclk().0);

        // sample the entry key before USART1 claims PA9
        let decision = decide(&mut board, &board_config, &region);

        let mut gpioa = device.GPIOA.split(&mut rcc.apb2);

        #[cfg(feature = "debug-log")]
        {
            let mut afio = device.AFIO.constrain(&mut rcc.apb2);
            let pin_tx = gpioa.pa9.into_alternate_push_pull(&mut gpioa.crh);
            let pin_rx = gpioa.pa10;

            let serial = Serial::usart1(
                device.USART1,
                (pin_tx, pin_rx),
                &mut afio.mapr,
                config::usart1_config(),
                clocks,
                &mut rcc.apb2,
            );
            let (tx, _) = serial.split();
            util::init_logger(tx);
        }

        log!("{} on {}\r\n", config::USB_PRODUCT, board_config.name);
        log!("{}\r\n", decision);

        if decision == Decision::RunApplication {
            leave(&mut board, &region);
        }

        let mut usb_dp = gpioa.pa12.into_push_pull_output(&mut gpioa.crh);
        usb_dp.set_low().ok();
        delay(clocks.sysclk().0 / 100);

        let usb_dm = gpioa.pa11;
        let usb_dp = usb_dp.into_floating_input(&mut gpioa.crh);

        let usb_bus: &'static _ = USB_BUS.insert(UsbBus::new(Peripheral {
            pin_dp: usb_dp,
            pin_dm: usb_dm,
            usb: device.USB,
        }));

        let (producer, consumer) = QUEUE.split();

        let dfu = Dfu::new(usb_bus, true, producer, &ENGINE);

        let mut timer = Timer::tim2(device.TIM2, &clocks, &mut rcc.apb1).start_count_down(1.khz());
        timer.listen(Event::Update);

        let usb_dev =
            UsbDeviceBuilder::new(usb_bus, UsbVidPid(USB_VID, USB_PID))
            .manufacturer(config::USB_MANUFACTURER)
            .product(config::USB_PRODUCT)
            .serial_number(config::USB_SERIAL_NO)
            .max_packet_size_0(64)
            .build();

        let valid = image_is_valid(&board, &region, board_config.ram_size);
        let mut resident = Resident::new(&board_config, region, valid, &ENGINE);
        resident.start(&mut board);

        init::LateResources {
            USB_DEV: usb_dev,
            DFU: dfu,
            TIMER_HANDLE: timer,
            BOARD: board,
            REGION: region,
            RESIDENT: resident,
            EVENTS: consumer,
        }
    }

    #[idle(resources = [BOARD, REGION, RESIDENT, EVENTS])]
    fn idle(c: idle::Context) -> ! {
        let board = c.resources.BOARD;
        let region = c.resources.REGION;
        let resident = c.resources.RESIDENT;
        let events = c.resources.EVENTS;

        loop {
            // flash work must not race the USB interrupt
            let outcome = cortex_m::interrupt::free(|_| resident.poll(board, events));

            if let Some(reason) = outcome {
                log!("Leaving bootloader: {}\r\n", reason);
                resident.release(board);
                leave(board, region);
                log!("Staying in bootloader\r\n");
                resident.stay();
                resident.start(board);
            }

            if !events.ready() {
                wfi();
            }
        }
    }

    #[task(binds = TIM2, priority = 2, resources = [TIMER_HANDLE])]
    fn tim2(c: tim2::Context) {
        TICKS.tick();
        c.resources.TIMER_HANDLE.clear_update_interrupt_flag();
    }

    #[task(binds = USB_HP_CAN_TX, priority = 1, resources = [USB_DEV, DFU])]
    fn USB_HP_CAN_TX(mut c: USB_HP_CAN_TX::Context) {
        usb_poll(&mut c.resources.USB_DEV, &mut c.resources.DFU);
    }

    #[task(binds = USB_LP_CAN_RX0, priority = 1, resources = [USB_DEV, DFU])]
    fn USB_LP_CAN_RX0(mut c: USB_LP_CAN_RX0::Context) {
        usb_poll(&mut c.resources.USB_DEV, &mut c.resources.DFU);
    }
};

fn usb_poll<B: bus::UsbBus>(
    usb_dev: &mut UsbDevice<'static, B>,
    dfu: &mut Dfu<'static, B>,
) {
    usb_dev.poll(&mut [dfu]);
}
