//! Hardware and network probing
//!
//! A [`ProbeSource`] answers one [`Fact`] at a time. Two implementations:
//!
//! - [`SystemProbe`]: reads `/proc`, `/sys` and `/etc` below a configurable
//!   root, asks `ip` for the primary IPv4 address and uses `nix` for the
//!   hostname and machine architecture.
//! - [`StaticProbe`]: answers from an in-memory map (tests, `--facts`).
//!
//! # Failure Mode
//!
//! Probing never aborts a run. Missing files, failed commands and unparsable
//! output all end up as "fact absent"; [`crate::facts::FactTable::build`]
//! logs them and moves on.

use crate::command_runner;
use crate::error::{AutoinstError, Result};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

/// One probed system property usable in rule predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Fact {
    InstalledProduct,
    InstalledProductVersion,
    Hostname,
    /// Primary IPv4 address
    #[strum(serialize = "hostaddress")]
    HostAddress,
    /// Network address of the primary interface
    Network,
    /// Prefix length of the primary interface
    Netmask,
    Domain,
    Arch,
    Karch,
    Product,
    ProductVendor,
    Board,
    BoardVendor,
    /// Installed memory in MiB
    Memsize,
    /// Sum of all disk sizes in MiB
    Totaldisk,
    /// First hardware address, lowercase hex without separators
    Mac,
    /// Primary IPv4 address as 8 uppercase hex digits
    Hostid,
    /// `yes` when booted through UEFI
    Efi,
    Uuid,
}

impl Fact {
    /// Key under which the fact is stored and referenced by rules
    pub fn key(self) -> String {
        self.to_string()
    }
}

/// Source of fact values.
pub trait ProbeSource {
    /// Probe one fact. `Ok(None)` means the hardware simply has no answer.
    fn probe(&self, fact: Fact) -> Result<Option<String>>;

    /// Run a custom rule script and return its trimmed stdout.
    fn run_script(&self, script: &str) -> Result<Option<String>>;
}

/// Run a script through `sh -c`; a failing script yields no value.
fn shell_script_value(script: &str) -> Result<Option<String>> {
    let output = command_runner::run_shell(script)
        .map_err(|e| AutoinstError::probe(format!("custom rule script: {:#}", e)))?;
    if !output.success {
        return Err(AutoinstError::probe(format!(
            "custom rule script exited with {}: {}",
            output.code(),
            output.stderr.trim()
        )));
    }
    Ok(Some(output.stdout.trim().to_string()))
}

// ============================================================================
// Firmware
// ============================================================================

/// Detected firmware mode of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareMode {
    Uefi,
    Bios,
}

impl FirmwareMode {
    /// Value of the `efi` fact
    pub fn fact_value(self) -> &'static str {
        match self {
            Self::Uefi => "yes",
            Self::Bios => "no",
        }
    }
}

/// The kernel exposes `/sys/firmware/efi` only when booted in UEFI mode.
pub fn detect_firmware_mode(root: &Path) -> FirmwareMode {
    if root.join("sys/firmware/efi").exists() {
        FirmwareMode::Uefi
    } else {
        FirmwareMode::Bios
    }
}

// ============================================================================
// SystemProbe
// ============================================================================

/// Primary IPv4 interface data, from one `ip` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Info {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Info {
    pub fn network(&self) -> Ipv4Addr {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix.min(32)))
        };
        Ipv4Addr::from(u32::from(self.address) & mask)
    }

    pub fn hostid(&self) -> String {
        self.address
            .octets()
            .iter()
            .map(|o| format!("{:02X}", o))
            .collect()
    }
}

/// Probes the running system.
#[derive(Debug)]
pub struct SystemProbe {
    root: PathBuf,
    ipv4: OnceCell<Option<Ipv4Info>>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SystemProbe {
    /// Create a probe reading system files below `root` (normally `/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ipv4: OnceCell::new(),
        }
    }

    fn read(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.root.join(relative))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn ipv4(&self) -> Option<Ipv4Info> {
        *self.ipv4.get_or_init(|| {
            let args = ["-o", "-4", "addr", "show", "scope", "global"].map(String::from);
            match command_runner::run_command("ip", &args) {
                Ok(out) if out.success => parse_ip_addr_output(&out.stdout),
                Ok(out) => {
                    tracing::warn!("ip addr failed ({}): {}", out.code(), out.stderr.trim());
                    None
                }
                Err(e) => {
                    tracing::warn!("Could not query routing table: {:#}", e);
                    None
                }
            }
        })
    }

    fn machine() -> Result<String> {
        let uts = nix::sys::utsname::uname()
            .map_err(|e| AutoinstError::probe(format!("uname: {}", e)))?;
        Ok(uts.machine().to_string_lossy().into_owned())
    }

    fn hostname(&self) -> Result<Option<String>> {
        if let Some(name) = self.read("etc/hostname") {
            return Ok(Some(name));
        }
        let name = nix::unistd::gethostname()
            .map_err(|e| AutoinstError::probe(format!("gethostname: {}", e)))?;
        Ok(Some(name.to_string_lossy().into_owned()).filter(|n| !n.is_empty()))
    }

    fn domain(&self) -> Result<Option<String>> {
        if let Some(domain) = self.read("etc/resolv.conf").and_then(|c| parse_resolv_domain(&c)) {
            return Ok(Some(domain));
        }
        Ok(self
            .hostname()?
            .and_then(|h| h.split_once('.').map(|(_, d)| d.to_string())))
    }

    fn mac(&self) -> Option<String> {
        let net = self.root.join("sys/class/net");
        let mut interfaces: Vec<String> = fs::read_dir(&net)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .collect();
        interfaces.sort();

        interfaces.iter().find_map(|name| {
            let raw = fs::read_to_string(net.join(name).join("address")).ok()?;
            normalize_mac(&raw)
        })
    }

    fn totaldisk(&self) -> Option<String> {
        let block = self.root.join("sys/block");
        let mut sectors: u64 = 0;
        let mut found = false;
        for entry in fs::read_dir(&block).ok()?.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_disk_device(&name) {
                continue;
            }
            if let Some(size) = fs::read_to_string(entry.path().join("size"))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
            {
                sectors += size;
                found = true;
            }
        }
        found.then(|| (sectors * 512 / 1024 / 1024).to_string())
    }

    fn os_release(&self, key: &str) -> Option<String> {
        self.read("etc/os-release")
            .and_then(|content| parse_os_release(&content).remove(key))
    }
}

impl ProbeSource for SystemProbe {
    fn probe(&self, fact: Fact) -> Result<Option<String>> {
        let value = match fact {
            Fact::InstalledProduct => self.os_release("NAME"),
            Fact::InstalledProductVersion => self.os_release("VERSION_ID"),
            Fact::Hostname => self.hostname()?,
            Fact::HostAddress => self.ipv4().map(|i| i.address.to_string()),
            Fact::Network => self.ipv4().map(|i| i.network().to_string()),
            Fact::Netmask => self.ipv4().map(|i| i.prefix.to_string()),
            Fact::Hostid => self.ipv4().map(|i| i.hostid()),
            Fact::Domain => self.domain()?,
            Fact::Arch => Some(normalize_arch(&Self::machine()?)),
            Fact::Karch => Some(Self::machine()?),
            Fact::Product => self.read("sys/class/dmi/id/product_name"),
            Fact::ProductVendor => self.read("sys/class/dmi/id/sys_vendor"),
            Fact::Board => self.read("sys/class/dmi/id/board_name"),
            Fact::BoardVendor => self.read("sys/class/dmi/id/board_vendor"),
            Fact::Uuid => self.read("sys/class/dmi/id/product_uuid"),
            Fact::Memsize => self
                .read("proc/meminfo")
                .and_then(|m| parse_meminfo_mib(&m))
                .map(|mib| mib.to_string()),
            Fact::Totaldisk => self.totaldisk(),
            Fact::Mac => self.mac(),
            Fact::Efi => Some(detect_firmware_mode(&self.root).fact_value().to_string()),
        };
        Ok(value)
    }

    fn run_script(&self, script: &str) -> Result<Option<String>> {
        shell_script_value(script)
    }
}

// ============================================================================
// StaticProbe
// ============================================================================

/// Answers facts from a fixed map.
///
/// Custom rule scripts are looked up in a script → output map first and run
/// through the shell otherwise.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    facts: BTreeMap<String, String>,
    scripts: BTreeMap<String, String>,
}

impl StaticProbe {
    pub fn new<K, V, I>(facts: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            facts: facts.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            scripts: BTreeMap::new(),
        }
    }

    /// Register the output a custom rule script should produce.
    pub fn with_script_output(mut self, script: impl Into<String>, output: impl Into<String>) -> Self {
        self.scripts.insert(script.into(), output.into());
        self
    }
}

impl ProbeSource for StaticProbe {
    fn probe(&self, fact: Fact) -> Result<Option<String>> {
        Ok(self.facts.get(&fact.key()).cloned())
    }

    fn run_script(&self, script: &str) -> Result<Option<String>> {
        match self.scripts.get(script) {
            Some(output) => Ok(Some(output.clone())),
            None => shell_script_value(script),
        }
    }
}

// ============================================================================
// Parsers
// ============================================================================

/// First `inet A.B.C.D/P` entry of `ip -o -4 addr show` output.
pub fn parse_ip_addr_output(output: &str) -> Option<Ipv4Info> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        let (addr, prefix) = tokens.next()?.split_once('/')?;
        Some(Ipv4Info {
            address: addr.parse().ok()?,
            prefix: prefix.parse().ok().filter(|p| *p <= 32)?,
        })
    })
}

/// `MemTotal` of /proc/meminfo in MiB.
pub fn parse_meminfo_mib(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib / 1024)
    })
}

/// Key/value pairs of an os-release file, quotes removed.
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_string(),
                v.trim().trim_matches('"').trim_matches('\'').to_string(),
            )
        })
        .collect()
}

/// `domain` line of resolv.conf, or the first `search` entry.
pub fn parse_resolv_domain(content: &str) -> Option<String> {
    let mut search = None;
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("domain") => return tokens.next().map(str::to_string),
            Some("search") if search.is_none() => search = tokens.next().map(str::to_string),
            _ => {}
        }
    }
    search
}

/// `00:0C:29:03:D2:88` → `000c2903d288`; all-zero addresses are ignored.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let mac: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_lowercase();
    if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) || mac.chars().all(|c| c == '0') {
        return None;
    }
    Some(mac)
}

/// Map kernel machine names to installer architecture names.
pub fn normalize_arch(machine: &str) -> String {
    match machine {
        "i486" | "i586" | "i686" => "i386".to_string(),
        "s390x" => "s390_64".to_string(),
        "s390" => "s390_32".to_string(),
        "ppc64le" | "ppc64" => "ppc64".to_string(),
        other => other.to_string(),
    }
}

fn is_disk_device(name: &str) -> bool {
    const SKIP: &[&str] = &["loop", "ram", "zram", "sr", "fd", "dm-", "md"];
    !SKIP.iter().any(|prefix| name.starts_with(prefix))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_fact_keys() {
        assert_eq!(Fact::HostAddress.key(), "hostaddress");
        assert_eq!(Fact::InstalledProductVersion.key(), "installed_product_version");
        assert_eq!(Fact::BoardVendor.key(), "board_vendor");
        assert_eq!(Fact::from_str("memsize").unwrap(), Fact::Memsize);
    }

    #[test]
    fn test_parse_ip_addr_output() {
        let out = "2: eth0    inet 10.69.57.43/24 brd 10.69.57.255 scope global eth0\\       valid_lft forever preferred_lft forever\n";
        let info = parse_ip_addr_output(out).unwrap();
        assert_eq!(info.address, Ipv4Addr::new(10, 69, 57, 43));
        assert_eq!(info.prefix, 24);
        assert_eq!(info.network(), Ipv4Addr::new(10, 69, 57, 0));
        assert_eq!(info.hostid(), "0A45392B");

        assert!(parse_ip_addr_output("").is_none());
        assert!(parse_ip_addr_output("2: eth0 inet garbage").is_none());
    }

    #[test]
    fn test_network_with_zero_and_full_prefix() {
        let any = Ipv4Info { address: Ipv4Addr::new(192, 168, 1, 7), prefix: 0 };
        assert_eq!(any.network(), Ipv4Addr::new(0, 0, 0, 0));
        let host = Ipv4Info { address: Ipv4Addr::new(192, 168, 1, 7), prefix: 32 };
        assert_eq!(host.network(), Ipv4Addr::new(192, 168, 1, 7));
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16777216 kB\nMemFree:         1000 kB\n";
        assert_eq!(parse_meminfo_mib(meminfo), Some(16384));
        assert_eq!(parse_meminfo_mib("MemFree: 1 kB"), None);
    }

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"openSUSE Leap\"\n# comment\nVERSION_ID='15.5'\nID=opensuse-leap\n";
        let parsed = parse_os_release(content);
        assert_eq!(parsed["NAME"], "openSUSE Leap");
        assert_eq!(parsed["VERSION_ID"], "15.5");
    }

    #[test]
    fn test_parse_resolv_domain() {
        assert_eq!(
            parse_resolv_domain("nameserver 1.1.1.1\nsearch suse.de example.com\n").as_deref(),
            Some("suse.de")
        );
        assert_eq!(
            parse_resolv_domain("search a.b\ndomain example.org\n").as_deref(),
            Some("example.org")
        );
        assert_eq!(parse_resolv_domain("nameserver 1.1.1.1\n"), None);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("00:0C:29:03:D2:88\n").as_deref(), Some("000c2903d288"));
        assert_eq!(normalize_mac("00:00:00:00:00:00"), None);
        assert_eq!(normalize_mac("zz:0c:29:03:d2:88"), None);
    }

    #[test]
    fn test_normalize_arch() {
        assert_eq!(normalize_arch("i686"), "i386");
        assert_eq!(normalize_arch("x86_64"), "x86_64");
        assert_eq!(normalize_arch("s390x"), "s390_64");
    }

    #[test]
    fn test_system_probe_reads_below_root() {
        let root = tempfile::tempdir().unwrap();
        let p = root.path();
        fs::create_dir_all(p.join("proc")).unwrap();
        fs::write(p.join("proc/meminfo"), "MemTotal: 2097152 kB\n").unwrap();
        fs::create_dir_all(p.join("etc")).unwrap();
        fs::write(p.join("etc/hostname"), "node12.example.com\n").unwrap();
        fs::write(p.join("etc/os-release"), "NAME=\"SLES\"\nVERSION_ID=\"15.6\"\n").unwrap();
        fs::create_dir_all(p.join("sys/class/dmi/id")).unwrap();
        fs::write(p.join("sys/class/dmi/id/product_name"), "VMware Virtual Platform\n").unwrap();
        fs::create_dir_all(p.join("sys/class/net/eth0")).unwrap();
        fs::create_dir_all(p.join("sys/class/net/lo")).unwrap();
        fs::write(p.join("sys/class/net/eth0/address"), "00:0c:29:03:d2:88\n").unwrap();
        fs::write(p.join("sys/class/net/lo/address"), "00:00:00:00:00:00\n").unwrap();
        for (dev, sectors) in [("sda", "41943040"), ("loop0", "1000"), ("vdb", "2097152")] {
            fs::create_dir_all(p.join("sys/block").join(dev)).unwrap();
            fs::write(p.join("sys/block").join(dev).join("size"), sectors).unwrap();
        }

        let probe = SystemProbe::new(p);
        assert_eq!(probe.probe(Fact::Memsize).unwrap().as_deref(), Some("2048"));
        assert_eq!(probe.probe(Fact::Hostname).unwrap().as_deref(), Some("node12.example.com"));
        assert_eq!(probe.probe(Fact::Domain).unwrap().as_deref(), Some("example.com"));
        assert_eq!(probe.probe(Fact::InstalledProduct).unwrap().as_deref(), Some("SLES"));
        assert_eq!(probe.probe(Fact::InstalledProductVersion).unwrap().as_deref(), Some("15.6"));
        assert_eq!(probe.probe(Fact::Product).unwrap().as_deref(), Some("VMware Virtual Platform"));
        assert_eq!(probe.probe(Fact::Mac).unwrap().as_deref(), Some("000c2903d288"));
        // 20 GiB + 1 GiB, loop device skipped
        assert_eq!(probe.probe(Fact::Totaldisk).unwrap().as_deref(), Some("21504"));
        assert_eq!(probe.probe(Fact::Efi).unwrap().as_deref(), Some("no"));
        assert_eq!(probe.probe(Fact::Board).unwrap(), None);
    }

    #[test]
    fn test_firmware_detection_below_root() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(detect_firmware_mode(root.path()), FirmwareMode::Bios);
        fs::create_dir_all(root.path().join("sys/firmware/efi")).unwrap();
        assert_eq!(detect_firmware_mode(root.path()), FirmwareMode::Uefi);
        assert_eq!(FirmwareMode::Uefi.fact_value(), "yes");
        assert_eq!(FirmwareMode::Bios.to_string(), "BIOS");
    }

    #[test]
    fn test_static_probe_answers_from_map() {
        let probe = StaticProbe::new([("memsize", "16384")]).with_script_output("echo x", "canned");
        assert_eq!(probe.probe(Fact::Memsize).unwrap().as_deref(), Some("16384"));
        assert_eq!(probe.probe(Fact::Mac).unwrap(), None);
        assert_eq!(probe.run_script("echo x").unwrap().as_deref(), Some("canned"));
        assert_eq!(probe.run_script("echo real").unwrap().as_deref(), Some("real"));
        assert!(probe.run_script("exit 1").is_err());
    }
}
