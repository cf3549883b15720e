//! OpalOS kernel entry point.
//!
//! Boot order matters: console first so diagnostics work, then GDT,
//! heap, interrupt manager and syscall gate, then drivers and the
//! network stack, and only then `sti`. Everything that must run after
//! interrupts are live happens inside kernel tasks, because the first
//! timer tick hands the CPU to the task queue for good.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::sync::Arc;
use core::panic::PanicInfo;
use opal_os::apps::{HttpHandler, UdpPrintHandler};
use opal_os::arch::x86;
use opal_os::boot::{multiboot, MultibootInfo};
use opal_os::drivers::keyboard::KeyboardDriver;
use opal_os::drivers::pcnet::{PcnetDriver, DEVICE_PCNET, VENDOR_AMD};
use opal_os::drivers::{self, DriverManager};
use opal_os::interrupts::{InterruptManager, HARDWARE_INTERRUPT_OFFSET};
use opal_os::net::arp::Arp;
use opal_os::net::device::NicDevice;
use opal_os::net::ethernet::EtherFrameProvider;
use opal_os::net::icmp::Icmp;
use opal_os::net::ip::Ipv4Provider;
use opal_os::net::tcp::{Tcp, TcpHandler};
use opal_os::net::udp::{Udp, UdpHandler};
use opal_os::net::Ipv4Address;
use opal_os::{gdt, mm, println, serial_println, syscall, task};
use spin::Mutex;

const OUR_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 15);
const GATEWAY_IP: Ipv4Address = Ipv4Address::new(10, 0, 2, 2);
const SUBNET_MASK: Ipv4Address = Ipv4Address::new(255, 255, 255, 0);
const HTTP_PORT: u16 = 1234;

const HEAP_START: usize = 10 * 1024 * 1024;
/// Safety margin kept free at the top of upper memory.
const HEAP_RESERVE: usize = 10 * 1024;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86::disable_interrupts();
    println!("\nKERNEL PANIC: {}", info);
    serial_println!("KERNEL PANIC: {}", info);
    x86::halt_loop();
}

/// Everything the network task needs, handed over from `kernel_main`
/// before the scheduler takes the CPU away.
struct NetContext {
    eth: Arc<EtherFrameProvider>,
    arp: Arc<Arp>,
    ip: Arc<Ipv4Provider>,
    icmp: Arc<Icmp>,
    udp: Arc<Udp>,
    tcp: Arc<Tcp>,
}

static NET_CONTEXT: Mutex<Option<NetContext>> = Mutex::new(None);

fn busy_delay() {
    for _ in 0..20_000_000u32 {
        core::hint::spin_loop();
    }
}

extern "C" fn task_a() -> ! {
    loop {
        syscall::write(c"A");
        busy_delay();
    }
}

extern "C" fn task_b() -> ! {
    loop {
        syscall::write(c"B");
        busy_delay();
    }
}

/// Network bring-up that has to wait for live interrupts: ARP needs
/// replies, so announcing and pinging only work once the NIC can
/// interrupt us.
extern "C" fn net_task() -> ! {
    let context = NET_CONTEXT.lock().take();

    let Some(context) = context else {
        x86::halt_loop();
    };
    let NetContext {
        eth: _eth,
        arp,
        ip: _ip,
        icmp,
        udp,
        tcp,
    } = context;

    arp.announce(GATEWAY_IP).ok();
    icmp.request_echo_reply(GATEWAY_IP).ok();

    let udp_handler: Arc<dyn UdpHandler> = Arc::new(UdpPrintHandler);
    let Ok(udp_socket) = udp.listen(HTTP_PORT) else {
        println!("udp socket table full");
        x86::halt_loop();
    };
    udp_socket.bind(&udp_handler);

    let tcp_handler: Arc<dyn TcpHandler> = Arc::new(HttpHandler);
    let Ok(tcp_socket) = tcp.listen(HTTP_PORT) else {
        println!("tcp socket table full");
        x86::halt_loop();
    };
    tcp_socket.bind(&tcp_handler);

    println!("listening on port {} (tcp http demo, udp echo print)", HTTP_PORT);
    syscall::write(c"net task up\n");

    x86::halt_loop();
}

#[no_mangle]
pub extern "C" fn kernel_main(multiboot_info: *const MultibootInfo, magic: u32) -> ! {
    drivers::serial::init();
    drivers::vga_buffer::clear_screen();
    println!("OpalOS 0.3.0");

    if !multiboot::verify_magic(magic) {
        println!("bad multiboot magic: 0x{:08X}", magic);
        x86::halt_loop();
    }

    gdt::init();

    let info = unsafe { &*multiboot_info };
    let Some(mem_upper_kb) = info.mem_upper_kb() else {
        println!("bootloader provided no memory information");
        x86::halt_loop();
    };
    let memory_top = mem_upper_kb as usize * 1024;
    if memory_top <= HEAP_START + HEAP_RESERVE {
        println!("not enough memory for the kernel heap");
        x86::halt_loop();
    }
    let heap_size = memory_top - HEAP_START - HEAP_RESERVE;
    unsafe {
        mm::init(HEAP_START, heap_size);
    }
    println!("heap: {} KiB at 0x{:08X}", heap_size / 1024, HEAP_START);

    let interrupts = InterruptManager::new(HARDWARE_INTERRUPT_OFFSET);
    let _syscalls = syscall::init(&interrupts);

    println!("initializing hardware");
    let mut driver_manager = DriverManager::new();

    let keyboard = KeyboardDriver::attach(&interrupts);
    driver_manager.add_driver(keyboard);

    drivers::timer::init();

    let nic = drivers::pci::find_device(VENDOR_AMD, DEVICE_PCNET).map(|descriptor| {
        println!(
            "pcnet at {:02X}:{:02X}.{} io 0x{:04X} irq {}",
            descriptor.bus,
            descriptor.device,
            descriptor.function,
            descriptor.port_base,
            descriptor.interrupt_line
        );
        let nic = PcnetDriver::attach(&descriptor, &interrupts);
        nic.set_ip_address(OUR_IP);
        driver_manager.add_driver(nic.clone());
        nic
    });
    if nic.is_none() {
        println!("no PCnet NIC found, network disabled");
    }

    driver_manager.activate_all();

    if let Some(nic) = nic {
        let device: Arc<dyn NicDevice> = nic;
        let eth = EtherFrameProvider::attach(device);
        let arp = Arp::attach(eth.clone());
        let ip = Ipv4Provider::attach(eth.clone(), arp.clone(), GATEWAY_IP, SUBNET_MASK);
        let icmp = Icmp::attach(ip.clone());
        let udp = Udp::attach(ip.clone());
        let tcp = Tcp::attach(ip.clone());
        println!("ip {} gw {} mask {}", OUR_IP, GATEWAY_IP, SUBNET_MASK);

        *NET_CONTEXT.lock() = Some(NetContext {
            eth,
            arp,
            ip,
            icmp,
            udp,
            tcp,
        });
    }

    task::spawn(net_task);
    task::spawn(task_a);
    task::spawn(task_b);

    interrupts.activate();
    println!("interrupts enabled, handing over to the scheduler");

    // The next timer tick moves the CPU into the task queue and never
    // comes back here.
    x86::halt_loop();
}
