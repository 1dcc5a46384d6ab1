//! Configuration files for the PXE daemons
//!
//! `dhcpd.conf` points the DPU at the EFI shim over TFTP; `grub.cfg` gives
//! it a single "Install OS" entry whose kernel arguments depend on whether
//! the ISO is CoreOS (live rootfs + ignition) or RHEL (Anaconda +
//! kickstart).

use crate::error::Result;
use minijinja::{context, Environment};
use std::fmt;
use std::net::Ipv4Addr;

const DHCPD_TEMPLATE: &str = r#"option space pxelinux;
option pxelinux.magic code 208 = string;
option pxelinux.configfile code 209 = text;
option pxelinux.pathprefix code 210 = text;
option pxelinux.reboottime code 211 = unsigned integer 32;
option architecture-type code 93 = unsigned integer 16;
allow booting;
allow bootp;

next-server {{ server_ip }};
always-broadcast on;

filename "{{ boot_file }}";

subnet {{ subnet }} netmask {{ netmask }} {
    range {{ range_start }} {{ range_end }};
    option broadcast-address {{ broadcast }};
    option routers {{ server_ip }};
{%- if dns_servers %}
    option domain-name-servers {{ dns_servers | join(", ") }};
{%- endif %}
{%- if domain_search %}
    option domain-search "{{ domain_search }}";
{%- endif %}
    option dhcp-client-identifier = option dhcp-client-identifier;
}
"#;

const GRUB_TEMPLATE: &str = r#"set timeout=5

menuentry '{{ install_entry }}' --class red --class gnu-linux --class gnu --class os {
    linux {{ base_path }}/vmlinuz showopts {{ kernel_opts }} \
        console=tty0 console=tty1 console=ttyS0,115200 console=ttyS1,115200 \
        ip=dhcp console=ttyAMA1 console=hvc0 \
        console=ttyAMA0 earlycon=pl011,0x01000000
    initrd {{ base_path }}/initrd.img{% if extra_initrd %} {{ extra_initrd }}{% endif %}
}

menuentry 'Reboot' --class red --class gnu-linux --class gnu --class os {
    reboot
}
"#;

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_template(name, source)?;
    Ok(env.get_template(name)?.render(ctx)?)
}

/// ISC dhcpd configuration for the DPU's private network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpdConfig {
    pub server_ip: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_search: Option<String>,
    pub boot_file: String,
}

impl Default for DhcpdConfig {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(172, 31, 100, 1),
            subnet: Ipv4Addr::new(172, 31, 100, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(172, 31, 100, 10),
            range_end: Ipv4Addr::new(172, 31, 100, 20),
            broadcast: Ipv4Addr::new(172, 31, 100, 255),
            dns_servers: Vec::new(),
            domain_search: None,
            boot_file: "/BOOTAA64.EFI".to_string(),
        }
    }
}

impl DhcpdConfig {
    pub fn with_server_ip(mut self, ip: Ipv4Addr) -> Self {
        self.server_ip = ip;
        self
    }

    pub fn with_range(mut self, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        self.range_start = start;
        self.range_end = end;
        self
    }

    pub fn with_dns_servers(mut self, servers: Vec<Ipv4Addr>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_domain_search(mut self, domain: impl Into<String>) -> Self {
        self.domain_search = Some(domain.into());
        self
    }

    pub fn render(&self) -> Result<String> {
        let dns: Vec<String> = self.dns_servers.iter().map(|ip| ip.to_string()).collect();
        render(
            "dhcpd.conf",
            DHCPD_TEMPLATE,
            context! {
                server_ip => self.server_ip.to_string(),
                subnet => self.subnet.to_string(),
                netmask => self.netmask.to_string(),
                range_start => self.range_start.to_string(),
                range_end => self.range_end.to_string(),
                broadcast => self.broadcast.to_string(),
                dns_servers => dns,
                domain_search => self.domain_search.clone(),
                boot_file => self.boot_file.clone(),
            },
        )
    }
}

/// Operating system family found on the install ISO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFlavor {
    CoreOs,
    Rhel,
}

impl fmt::Display for OsFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFlavor::CoreOs => f.write_str("CoreOS"),
            OsFlavor::Rhel => f.write_str("RHEL"),
        }
    }
}

/// GRUB menu served over TFTP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubConfig {
    pub flavor: OsFlavor,
    pub server_ip: Ipv4Addr,
    /// Directory of kernel/initrd relative to the TFTP root
    pub base_path: String,
    pub install_entry: String,
}

impl GrubConfig {
    pub fn new(flavor: OsFlavor, server_ip: Ipv4Addr) -> Self {
        Self {
            flavor,
            server_ip,
            base_path: "pxelinux".to_string(),
            install_entry: "Install OS".to_string(),
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    fn kernel_opts(&self) -> String {
        let ip = self.server_ip;
        match self.flavor {
            OsFlavor::CoreOs => format!(
                "coreos.live.rootfs_url=http://{}/rootfs.img ignition.firstboot ignition.platform.id=metal",
                ip
            ),
            OsFlavor::Rhel => format!("inst.repo=http://{ip}/mnt inst.ks=http://{ip}/kickstart.ks"),
        }
    }

    pub fn render(&self) -> Result<String> {
        let extra_initrd = match self.flavor {
            OsFlavor::CoreOs => Some(format!("{}/ignition.img", self.base_path)),
            OsFlavor::Rhel => None,
        };
        render(
            "grub.cfg",
            GRUB_TEMPLATE,
            context! {
                install_entry => self.install_entry.clone(),
                base_path => self.base_path.clone(),
                kernel_opts => self.kernel_opts(),
                extra_initrd => extra_initrd,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhcpd_defaults() {
        let conf = DhcpdConfig::default().render().unwrap();
        assert!(conf.starts_with("option space pxelinux;\n"));
        assert!(conf.contains("next-server 172.31.100.1;"));
        assert!(conf.contains("filename \"/BOOTAA64.EFI\";"));
        assert!(conf.contains("subnet 172.31.100.0 netmask 255.255.255.0 {"));
        assert!(conf.contains("range 172.31.100.10 172.31.100.20;"));
        assert!(conf.contains("option routers 172.31.100.1;"));
        assert!(!conf.contains("domain-name-servers"));
        assert!(!conf.contains("domain-search"));
        assert!(conf.ends_with("}\n"));
    }

    #[test]
    fn test_dhcpd_dns() {
        let conf = DhcpdConfig::default()
            .with_dns_servers(vec![Ipv4Addr::new(10, 19, 42, 41), Ipv4Addr::new(10, 2, 32, 1)])
            .with_domain_search("lab.example.com")
            .render()
            .unwrap();
        assert!(conf.contains("    option domain-name-servers 10.19.42.41, 10.2.32.1;\n"));
        assert!(conf.contains("    option domain-search \"lab.example.com\";\n"));
    }

    #[test]
    fn test_grub_coreos() {
        let cfg = GrubConfig::new(OsFlavor::CoreOs, Ipv4Addr::new(172, 31, 100, 1))
            .render()
            .unwrap();
        assert!(cfg.contains("menuentry 'Install OS'"));
        assert!(cfg.contains(
            "linux pxelinux/vmlinuz showopts coreos.live.rootfs_url=http://172.31.100.1/rootfs.img ignition.firstboot"
        ));
        assert!(cfg.contains("initrd pxelinux/initrd.img pxelinux/ignition.img\n"));
        assert!(cfg.contains("menuentry 'Reboot'"));
    }

    #[test]
    fn test_grub_rhel() {
        let cfg = GrubConfig::new(OsFlavor::Rhel, Ipv4Addr::new(172, 31, 100, 1))
            .render()
            .unwrap();
        assert!(cfg.contains("inst.repo=http://172.31.100.1/mnt inst.ks=http://172.31.100.1/kickstart.ks"));
        assert!(cfg.contains("initrd pxelinux/initrd.img\n"));
        assert!(!cfg.contains("ignition"));
    }
}
