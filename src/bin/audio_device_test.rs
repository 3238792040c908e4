use std::time::Duration;
use tutorlive::audio::devices::{list_devices, list_sinks, DeviceType};
use tutorlive::audio::{AudioBackend, PulseBackend};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("Available audio input devices:");
    match list_devices(DeviceType::Any) {
        Ok(devices) if devices.is_empty() => println!("No audio input devices found!"),
        Ok(devices) => {
            for (i, device) in devices.iter().enumerate() {
                println!(
                    "{}: {} ({})",
                    i + 1,
                    device.description,
                    if device.is_monitor { "Monitor" } else { "Microphone" }
                );
                println!("   Name: {}", device.name);
                println!("   Rate: {} Hz, Channels: {}", device.sample_rate, device.channels);
                println!();
            }
        }
        Err(e) => println!("Error listing input devices: {}", e),
    }

    println!("Available audio output devices:");
    match list_sinks() {
        Ok(sinks) => {
            for (i, sink) in sinks.iter().enumerate() {
                println!("{}: {}", i + 1, sink.description);
                println!("   Name: {}", sink.name);
            }
        }
        Err(e) => println!("Error listing output devices: {}", e),
    }

    // Open each microphone the way a session would
    println!("\nTesting microphone connections...");
    for device in list_devices(DeviceType::Microphone)? {
        println!("Trying {}", device.description);
        let backend = PulseBackend::new("tutorlive-test").with_devices(Some(device.name), None);
        match backend.open_microphone(16_000, 4096) {
            Ok(mut microphone) => {
                std::thread::sleep(Duration::from_millis(500));
                let windows = std::iter::from_fn(|| microphone.windows.try_recv().ok()).count();
                println!("  ok ({} window(s) captured)", windows);
                microphone.device.release();
            }
            Err(e) => println!("  failed: {}", e),
        }
    }

    println!("\nAudio device test complete!");
    Ok(())
}
