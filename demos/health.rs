use std::time::Duration;

use panda::panda::Panda;

fn main() -> panda::Result<()> {
    panda::logging::init();

    let mut panda = Panda::new()?;
    println!(
        "{} {} ({}) running {}",
        panda.serial().unwrap_or_default().to_owned(),
        panda.hw_type(),
        panda.get_mcu_type()?,
        panda.get_version()?
    );

    loop {
        let health = panda.health()?;
        println!(
            "uptime {} s, {} mV, {} mA, harness {:?}",
            health.uptime,
            health.voltage,
            health.current,
            health.harness_status()
        );

        for bus in 0..3 {
            let can = panda.can_health(bus)?;
            println!(
                "  bus {}: {} kbps, rx {} tx {}, errors {}",
                bus, can.can_speed, can.total_rx_cnt, can.total_tx_cnt, can.total_error_cnt
            );
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}
