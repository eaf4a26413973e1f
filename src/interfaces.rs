#[cfg(target_os = "linux")]
use anyhow::Context;
use pnet::datalink;

// RTF_UP
const ROUTE_FLAG_UP: u32 = 0x0001;

/// 当前默认路由所在的网卡；Wi-Fi/有线切换时会变化。
///
/// Linux reads `/proc/net/route`; elsewhere (or when no default route exists)
/// every up, non-loopback interface with an IPv4 address is returned.
pub fn default_route_interfaces() -> anyhow::Result<Vec<String>> {
    #[cfg(target_os = "linux")]
    {
        let raw = std::fs::read_to_string("/proc/net/route").context("read /proc/net/route")?;
        let names = parse_proc_net_route(&raw);
        if !names.is_empty() {
            return Ok(names);
        }
    }
    Ok(fallback_interfaces())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub fn parse_proc_net_route(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    // Iface Destination Gateway Flags RefCnt Use Metric Mask MTU Window IRTT
    for line in raw.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 8 {
            continue;
        }
        let flags = u32::from_str_radix(cols[3], 16).unwrap_or(0);
        if cols[1] == "00000000" && cols[7] == "00000000" && flags & ROUTE_FLAG_UP != 0 {
            let name = cols[0].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

fn fallback_interfaces() -> Vec<String> {
    datalink::interfaces()
        .into_iter()
        .filter(|i| i.is_up() && !i.is_loopback() && i.ips.iter().any(|ip| ip.is_ipv4()))
        .map(|i| i.name)
        .collect()
}
