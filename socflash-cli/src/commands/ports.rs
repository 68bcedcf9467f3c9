//! `list-ports`: serial endpoints and the device mode they imply.

use {
    console::style,
    socflash::device::{self, DetectedPort, DeviceMode},
};

/// Render the port list as JSON.
fn ports_json(ports: &[DetectedPort]) -> String {
    serde_json::to_string_pretty(ports).unwrap_or_else(|_| "[]".to_string())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) {
    let detected = device::detect_ports();

    if json {
        println!("{}", ports_json(&detected));
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for (port, line) in detected
        .iter()
        .zip(device::format_port_list(&detected))
    {
        let bullet = if port.mode == DeviceMode::Unknown {
            style("•").dim()
        } else {
            style("•").green()
        };
        eprintln!("  {bullet} {line}");
    }

    let status = device::classify(&detected);
    if let Some(port) = status.port {
        eprintln!(
            "\n{} SoC in {} mode on {}",
            style("→").green().bold(),
            style(status.mode).yellow(),
            style(port).cyan().bold()
        );
    }
}
