//! Flattened Device Tree writer
//!
//! Minimal FDT builder plus the boot device tree describing the machine
//! to the guest kernel. The finished blob is size-checked against the low
//! RAM window before it is placed there.

use std::collections::HashMap;

use crate::config::MachineConfig;
use crate::devices::clint::RTC_FREQ_DIV;
use crate::pma::{PMA_CLINT_LENGTH, PMA_CLINT_START, PMA_HTIF_LENGTH, PMA_HTIF_START, PMA_RAM_START};

const FDT_MAGIC: u32 = 0xD00DFEED;
const FDT_VERSION: u32 = 17;
const FDT_LAST_COMP_VERSION: u32 = 16;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Nominal clock for the timebase exported to the guest.
pub const CLOCK_FREQ: u64 = 1_000_000_000;

pub struct FdtBuilder {
    struct_buf: Vec<u8>,
    strings_buf: Vec<u8>,
    string_offsets: HashMap<String, u32>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        FdtBuilder {
            struct_buf: Vec::new(),
            strings_buf: Vec::new(),
            string_offsets: HashMap::new(),
        }
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.struct_buf.extend_from_slice(name.as_bytes());
        self.struct_buf.push(0);
        self.align(4);
    }

    pub fn begin_node_num(&mut self, name: &str, address: u64) {
        self.begin_node(&format!("{name}@{address:x}"));
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn property(&mut self, name: &str, data: &[u8]) {
        self.push_u32(FDT_PROP);
        self.push_u32(data.len() as u32);
        let name_off = self.string_offset(name);
        self.push_u32(name_off);
        self.struct_buf.extend_from_slice(data);
        self.align(4);
    }

    pub fn property_u32(&mut self, name: &str, value: u32) {
        self.property(name, &value.to_be_bytes());
    }

    pub fn property_null(&mut self, name: &str) {
        self.property(name, &[]);
    }

    pub fn property_string(&mut self, name: &str, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.property(name, &data);
    }

    pub fn property_array_u32(&mut self, name: &str, values: &[u32]) {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_be_bytes());
        }
        self.property(name, &data);
    }

    /// A `reg` property holding one (address, length) pair of u64 cells.
    pub fn property_reg_u64(&mut self, name: &str, address: u64, length: u64) {
        self.property_array_u32(
            name,
            &[
                (address >> 32) as u32,
                address as u32,
                (length >> 32) as u32,
                length as u32,
            ],
        );
    }

    fn push_u32(&mut self, v: u32) {
        self.struct_buf.extend_from_slice(&v.to_be_bytes());
    }

    fn align(&mut self, alignment: usize) {
        while self.struct_buf.len() % alignment != 0 {
            self.struct_buf.push(0);
        }
    }

    fn string_offset(&mut self, s: &str) -> u32 {
        if let Some(&off) = self.string_offsets.get(s) {
            return off;
        }
        let off = self.strings_buf.len() as u32;
        self.strings_buf.extend_from_slice(s.as_bytes());
        self.strings_buf.push(0);
        self.string_offsets.insert(s.to_string(), off);
        off
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        let off_mem_rsvmap = 40u32;
        let rsvmap_size = 16u32;
        let off_dt_struct = off_mem_rsvmap + rsvmap_size;
        let size_dt_struct = self.struct_buf.len() as u32;
        let off_dt_strings = off_dt_struct + size_dt_struct;
        let size_dt_strings = self.strings_buf.len() as u32;
        let totalsize = off_dt_strings + size_dt_strings;

        let mut blob = Vec::with_capacity(totalsize as usize);
        blob.extend_from_slice(&FDT_MAGIC.to_be_bytes());
        blob.extend_from_slice(&totalsize.to_be_bytes());
        blob.extend_from_slice(&off_dt_struct.to_be_bytes());
        blob.extend_from_slice(&off_dt_strings.to_be_bytes());
        blob.extend_from_slice(&off_mem_rsvmap.to_be_bytes());
        blob.extend_from_slice(&FDT_VERSION.to_be_bytes());
        blob.extend_from_slice(&FDT_LAST_COMP_VERSION.to_be_bytes());
        blob.extend_from_slice(&0u32.to_be_bytes()); // boot_cpuid_phys
        blob.extend_from_slice(&size_dt_strings.to_be_bytes());
        blob.extend_from_slice(&size_dt_struct.to_be_bytes());

        // Empty reserve map terminator.
        blob.extend_from_slice(&0u64.to_be_bytes());
        blob.extend_from_slice(&0u64.to_be_bytes());

        blob.extend_from_slice(&self.struct_buf);
        blob.extend_from_slice(&self.strings_buf);
        blob
    }
}

impl Default for FdtBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ISA string derived from misa, e.g. "rv64imasu".
fn isa_string(misa: u64) -> String {
    let mut isa = String::from("rv64");
    for i in 0..26u32 {
        if misa & (1 << i) != 0 {
            isa.push((b'a' + i as u8) as char);
        }
    }
    isa
}

/// Builds the boot device tree for a machine configuration.
pub fn build_boot_fdt(config: &MachineConfig, misa: u64) -> Vec<u8> {
    let mut fdt = FdtBuilder::new();
    let mut phandle = 1u32;

    fdt.begin_node("");
    fdt.property_u32("#address-cells", 2);
    fdt.property_u32("#size-cells", 2);
    fdt.property_string("compatible", "ucbbar,riscvemu-bar_dev");
    fdt.property_string("model", "ucbbar,riscvemu-bare");

    fdt.begin_node("cpus");
    fdt.property_u32("#address-cells", 1);
    fdt.property_u32("#size-cells", 0);
    fdt.property_u32("timebase-frequency", (CLOCK_FREQ / RTC_FREQ_DIV) as u32);
    fdt.begin_node_num("cpu", 0);
    fdt.property_string("device_type", "cpu");
    fdt.property_u32("reg", 0);
    fdt.property_string("status", "okay");
    fdt.property_string("compatible", "riscv");
    fdt.property_string("riscv,isa", &isa_string(misa));
    fdt.property_string("mmu-type", "riscv,sv48");
    fdt.property_u32("clock-frequency", CLOCK_FREQ as u32);
    fdt.begin_node("interrupt-controller");
    fdt.property_u32("#interrupt-cells", 1);
    fdt.property_null("interrupt-controller");
    fdt.property_string("compatible", "riscv,cpu-intc");
    let intc_phandle = phandle;
    phandle += 1;
    fdt.property_u32("phandle", intc_phandle);
    fdt.end_node(); // interrupt-controller
    fdt.end_node(); // cpu
    fdt.end_node(); // cpus

    fdt.begin_node_num("memory", PMA_RAM_START);
    fdt.property_string("device_type", "memory");
    fdt.property_reg_u64("reg", PMA_RAM_START, config.ram_length);
    fdt.end_node();

    for drive in &config.flash {
        fdt.begin_node_num("flash", drive.start);
        fdt.property_u32("#address-cells", 2);
        fdt.property_u32("#size-cells", 2);
        fdt.property_string("compatible", "mtd-ram");
        fdt.property_u32("bank-width", 4);
        fdt.property_reg_u64("reg", drive.start, drive.length);
        fdt.begin_node_num("fs0", 0);
        fdt.property_string("label", &drive.label);
        fdt.property_reg_u64("reg", 0, drive.length);
        fdt.end_node();
        fdt.end_node();
    }

    fdt.begin_node("soc");
    fdt.property_u32("#address-cells", 2);
    fdt.property_u32("#size-cells", 2);
    fdt.property("compatible", b"ucbbar,riscvemu-bar-soc\0simple-bus\0");
    fdt.property_null("ranges");

    fdt.begin_node_num("clint", PMA_CLINT_START);
    fdt.property_string("compatible", "riscv,clint0");
    fdt.property_array_u32("interrupts-extended", &[intc_phandle, 3, intc_phandle, 7]);
    fdt.property_reg_u64("reg", PMA_CLINT_START, PMA_CLINT_LENGTH);
    fdt.end_node();

    fdt.begin_node_num("htif", PMA_HTIF_START);
    fdt.property_string("compatible", "ucb,htif0");
    fdt.property_reg_u64("reg", PMA_HTIF_START, PMA_HTIF_LENGTH);
    fdt.property_array_u32("interrupts-extended", &[intc_phandle, 13]);
    fdt.end_node();

    fdt.end_node(); // soc

    fdt.begin_node("chosen");
    fdt.property_string("bootargs", &config.cmdline);
    fdt.end_node();

    fdt.end_node(); // root
    fdt.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;

    #[test]
    fn header_is_well_formed() {
        let config = MachineConfig::new(64 << 20);
        let blob = build_boot_fdt(&config, crate::cpu::csr::MISA_INIT);
        assert_eq!(u32::from_be_bytes(blob[0..4].try_into().unwrap()), FDT_MAGIC);
        let totalsize = u32::from_be_bytes(blob[4..8].try_into().unwrap());
        assert_eq!(totalsize as usize, blob.len());
    }

    #[test]
    fn isa_string_names_extensions() {
        assert_eq!(isa_string(crate::cpu::csr::MISA_INIT), "rv64aimsu");
    }

    #[test]
    fn bootargs_are_embedded() {
        let mut config = MachineConfig::new(64 << 20);
        config.cmdline = "console=hvc0 rootfstype=ext2".into();
        let blob = build_boot_fdt(&config, crate::cpu::csr::MISA_INIT);
        let needle = b"console=hvc0 rootfstype=ext2";
        assert!(blob.windows(needle.len()).any(|w| w == needle));
    }
}
