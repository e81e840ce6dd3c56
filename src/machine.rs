//! Machine orchestrator
//!
//! Owns the machine state and its Merkle tree, builds both from a
//! configuration, and exposes the three entry points: `run` (fast),
//! `step` (logged) and log verification (replay).

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use crate::access::{
    AccessError, AccessLog, BracketType, DirectAccess, LogType, LoggedAccess, ReplayAccess,
    StateAccess,
};
use crate::config::MachineConfig;
use crate::cpu::csr::MIP_MTIP;
use crate::cpu::interpret;
use crate::devices::clint::{rtc_time_to_cycles, RTC_FREQ_DIV};
use crate::devices::htif::{self, Console};
use crate::fdt;
use crate::merkle::{Hash, MerkleTree, Proof, PAGE_SIZE};
use crate::pma::{
    PmaDid, PmaEntry, PMA_CLINT_LENGTH, PMA_CLINT_START, PMA_HTIF_LENGTH, PMA_HTIF_START,
    PMA_LOW_RAM_LENGTH, PMA_LOW_RAM_START, PMA_MAX_FLASH, PMA_PAGE_SHIFT, PMA_RAM_START,
    PMA_SHADOW_LENGTH, PMA_SHADOW_START,
};
use crate::state::MachineState;

/// Why construction failed. No partial machine is ever exposed.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid RAM length {length:#x}")]
    InvalidRamSize { length: u64 },
    #[error("boot image ({image} bytes) does not fit in RAM ({ram} bytes)")]
    BootImageTooBig { image: usize, ram: u64 },
    #[error("no boot image")]
    MissingBootImage,
    #[error("PMA range {start:#x}+{length:#x} overlaps an existing range")]
    PmaOverlap { start: u64, length: u64 },
    #[error("PMA range {start:#x}+{length:#x} is not page-aligned")]
    PmaMisaligned { start: u64, length: u64 },
    #[error("too many PMA ranges")]
    TooManyPmas,
    #[error("too many flash drives")]
    TooManyFlashDrives,
    #[error("machine already has a {0} device")]
    DuplicateDevice(&'static str),
    #[error("device tree ({needed} bytes) does not fit in low RAM ({available} bytes)")]
    FdtOverflow { needed: usize, available: usize },
    #[error("cannot use backing file {}: {source}", path.display())]
    Backing { path: PathBuf, source: io::Error },
    #[error("backing file {} is {actual} bytes, drive wants {expected}", path.display())]
    BackingSizeMismatch { path: PathBuf, expected: u64, actual: u64 },
    #[error("cannot attach console: {0}")]
    Terminal(io::Error),
    #[error("address {paddr:#x} is not inside a memory range")]
    UnmappedAddress { paddr: u64 },
}

/// How a `run` call came back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// mcycle reached the requested target.
    Done,
    /// The machine halted permanently.
    Halted,
    /// The machine yielded control back to the host.
    Yielded,
}

pub struct Machine {
    state: MachineState,
    tree: MerkleTree,
    console: Option<Console>,
}

/// Offset of the device tree inside low RAM.
const FDT_OFFSET: u64 = 8 * 8;

impl Machine {
    /// Builds a machine from its configuration: registers the permanent
    /// ranges, loads the boot image, and writes the boot trampoline and
    /// device tree into low RAM.
    pub fn new(config: MachineConfig) -> Result<Machine, MachineError> {
        if config.ram_length == 0 || config.ram_length & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(MachineError::InvalidRamSize { length: config.ram_length });
        }
        if config.boot_image.is_empty() {
            return Err(MachineError::MissingBootImage);
        }
        if config.boot_image.len() as u64 > config.ram_length {
            return Err(MachineError::BootImageTooBig {
                image: config.boot_image.len(),
                ram: config.ram_length,
            });
        }
        if config.flash.len() > PMA_MAX_FLASH {
            return Err(MachineError::TooManyFlashDrives);
        }

        let mut state = MachineState::new();
        state.htif.ihalt = config.htif.ihalt;
        state.htif.iconsole = config.htif.iconsole;
        state.htif.iyield = config.htif.iyield;

        state.register_pma(PmaEntry::ram(PMA_RAM_START, config.ram_length)?)?;
        state.register_pma(PmaEntry::ram(PMA_LOW_RAM_START, PMA_LOW_RAM_LENGTH)?)?;
        for drive in &config.flash {
            state.register_pma(PmaEntry::flash(
                drive.start,
                drive.length,
                &drive.backing,
                drive.shared,
            )?)?;
        }
        state.register_pma(PmaEntry::device(PMA_CLINT_START, PMA_CLINT_LENGTH, PmaDid::Clint)?)?;
        state.register_pma(PmaEntry::device(PMA_HTIF_START, PMA_HTIF_LENGTH, PmaDid::Htif)?)?;
        state.register_pma(PmaEntry::device(PMA_SHADOW_START, PMA_SHADOW_LENGTH, PmaDid::Shadow)?)?;

        let console = if config.interactive {
            Some(Console::interactive().map_err(MachineError::Terminal)?)
        } else {
            None
        };

        let mut machine = Machine { state, tree: MerkleTree::new(), console };
        machine.host_write(PMA_RAM_START, &config.boot_image)?;
        machine.write_boot_trampoline(&config)?;

        // Flash content arrives through the mapping; make sure the first
        // tree refresh hashes all of it.
        for pma in &mut machine.state.pmas {
            if pma.is_memory() {
                pma.mark_all_dirty();
            }
        }
        machine.state.set_brk_from_all();
        info!(
            ram = config.ram_length,
            flash = config.flash.len(),
            image = config.boot_image.len(),
            "machine initialized"
        );
        Ok(machine)
    }

    /// The 5-instruction trampoline at the reset pc: point a1 at the
    /// device tree, load the hart id into a0, and jump to RAM.
    fn write_boot_trampoline(&mut self, config: &MachineConfig) -> Result<(), MachineError> {
        let blob = fdt::build_boot_fdt(config, self.state.misa);
        let available = (PMA_LOW_RAM_LENGTH - FDT_OFFSET) as usize;
        if blob.len() > available {
            return Err(MachineError::FdtOverflow { needed: blob.len(), available });
        }
        self.host_write(PMA_LOW_RAM_START + FDT_OFFSET, &blob)?;

        let trampoline: [u32; 5] = [
            // auipc t0, RAM start
            0x297u32.wrapping_add((PMA_RAM_START - PMA_LOW_RAM_START) as u32),
            // auipc a1, 0
            0x597,
            // addi a1, a1, <device tree>
            0x58593 + (((FDT_OFFSET - 4) as u32) << 20),
            // csrr a0, mhartid
            0xF1402573,
            // jr t0
            0x28067,
        ];
        let mut code = [0u8; 20];
        for (i, insn) in trampoline.iter().enumerate() {
            code[i * 4..i * 4 + 4].copy_from_slice(&insn.to_le_bytes());
        }
        self.host_write(PMA_LOW_RAM_START, &code)
    }

    /// Writes host bytes into a memory range, marking pages dirty.
    pub fn host_write(&mut self, paddr: u64, data: &[u8]) -> Result<(), MachineError> {
        let index = self
            .state
            .find_pma_index(paddr, data.len() as u64)
            .filter(|&i| self.state.pmas[i].is_memory())
            .ok_or(MachineError::UnmappedAddress { paddr })?;
        let pma = &mut self.state.pmas[index];
        let at = (paddr - pma.start()) as usize;
        pma.bytes_mut()[at..at + data.len()].copy_from_slice(data);
        let first_page = paddr & !(PAGE_SIZE as u64 - 1);
        let last = paddr + data.len().max(1) as u64 - 1;
        let mut page = first_page;
        while page <= last {
            pma.mark_dirty(page);
            page += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Reads host bytes out of a memory range.
    pub fn host_read(&self, paddr: u64, len: usize) -> Result<Vec<u8>, MachineError> {
        let index = self
            .state
            .find_pma_index(paddr, len as u64)
            .filter(|&i| self.state.pmas[i].is_memory())
            .ok_or(MachineError::UnmappedAddress { paddr })?;
        let pma = &self.state.pmas[index];
        let at = (paddr - pma.start()) as usize;
        Ok(pma.bytes()[at..at + len].to_vec())
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        &mut self.state
    }

    pub fn read_mcycle(&self) -> u64 {
        self.state.mcycle
    }

    pub fn halted(&self) -> bool {
        self.state.iflags.h
    }

    pub fn yielded(&self) -> bool {
        self.state.iflags.y
    }

    /// Reads one aligned word from anywhere in the physical space.
    pub fn read_word(&self, paddr: u64) -> Option<u64> {
        self.state.read_word(paddr)
    }

    /// Runs until mcycle reaches `mcycle_end`, the machine halts, or it
    /// yields. The outer loop ticks the timer every `RTC_FREQ_DIV` cycles
    /// and feeds the console.
    pub fn run(&mut self, mcycle_end: u64) -> RunStatus {
        // A yielded machine resumes when run again.
        self.state.iflags.y = false;
        loop {
            self.state.set_brk_from_all();
            let mcycle = self.state.mcycle;
            let next_rtc_batch = mcycle + (RTC_FREQ_DIV - mcycle % RTC_FREQ_DIV);
            let this_end = mcycle_end.min(next_rtc_batch);
            {
                let mut a = DirectAccess::new(&mut self.state);
                match interpret(&mut a, this_end) {
                    Ok(()) => {}
                    Err(never) => match never {},
                }
            }

            if self.state.iflags.h {
                return RunStatus::Halted;
            }
            if self.state.iflags.y {
                return RunStatus::Yielded;
            }
            if self.state.mcycle >= mcycle_end {
                return RunStatus::Done;
            }

            // While idle, skip ahead to the earlier of the next timer
            // expiry and the target; the interpreter raises MTIP itself.
            if self.state.iflags.i && self.state.mip & MIP_MTIP == 0 {
                let timer_cycles = rtc_time_to_cycles(self.state.clint.mtimecmp);
                if timer_cycles > self.state.mcycle {
                    self.state.mcycle = timer_cycles.min(mcycle_end);
                }
            }

            // Console: feed one character once the guest consumed the
            // previous one.
            if let Some(console) = self.console.as_mut() {
                if self.state.htif.fromhost == 0 {
                    if let Some(ch) = console.poll(self.state.iflags.i) {
                        self.state.htif.fromhost =
                            htif::build_fromhost(htif::DEV_CONSOLE, htif::CONSOLE_CMD_GETCHAR, ch as u64);
                        self.state.iflags.i = false;
                    }
                }
            }
        }
    }

    /// Executes exactly one retire under the logging backend. The
    /// returned log carries every word access with proofs anchored in the
    /// pre-step root; afterwards the tree reflects the post-step state.
    pub fn step(&mut self, log_type: LogType) -> AccessLog {
        self.update_merkle_tree();
        let mcycle = self.state.mcycle;
        let mut a = LoggedAccess::new(&mut self.state, &mut self.tree, log_type);
        a.push_bracket(BracketType::Begin, "step");
        match interpret(&mut a, mcycle.wrapping_add(1)) {
            Ok(()) => {}
            Err(never) => match never {},
        }
        a.push_bracket(BracketType::End, "step");
        let (log, final_root) = a.finish();
        self.update_merkle_tree();
        debug_assert_eq!(final_root, self.tree.root_hash());
        debug!(accesses = log.accesses.len(), "step logged");
        log
    }

    /// Replays an access log against its own proofs, returning the final
    /// root hash. Fails with the 1-based index of the offending access.
    pub fn verify_access_log(log: &AccessLog, verify_proofs: bool) -> Result<Hash, AccessError> {
        let mut a = ReplayAccess::new(log, verify_proofs)?;
        interpret(&mut a, u64::MAX)?;
        a.finish()?;
        Ok(a.root_hash())
    }

    /// Brings the Merkle tree in sync with the machine state. Memory
    /// ranges refresh their dirty pages; device ranges are re-projected.
    pub fn update_merkle_tree(&mut self) {
        let mut scratch = [0u8; PAGE_SIZE];
        self.tree.begin_update();
        for index in 0..self.state.pmas.len() {
            let is_memory = self.state.pmas[index].is_memory();
            let start = self.state.pmas[index].start();
            for page in 0..self.state.pmas[index].page_count() {
                if is_memory && !self.state.pmas[index].is_page_dirty(page) {
                    continue;
                }
                let page_offset = (page as u64) << PMA_PAGE_SHIFT;
                let page_address = start + page_offset;
                if let Some(bytes) = self.state.peek_page(index, page_offset, &mut scratch) {
                    if self.tree.is_page_pristine(page_address) && bytes.iter().all(|&b| b == 0) {
                        continue;
                    }
                    let page_bytes: &[u8; PAGE_SIZE] =
                        bytes.try_into().expect("peek returns whole pages");
                    self.tree.update_page(page_address, page_bytes);
                }
            }
            self.state.pmas[index].clear_dirty();
        }
        self.tree.end_update();
    }

    /// Refreshes the page containing `paddr` after an out-of-band write.
    pub fn update_merkle_tree_page(&mut self, paddr: u64) {
        let Some(index) = self.state.find_pma_index(paddr, 1) else {
            return;
        };
        let start = self.state.pmas[index].start();
        let page_offset = (paddr - start) & !(PAGE_SIZE as u64 - 1);
        let mut scratch = [0u8; PAGE_SIZE];
        if let Some(bytes) = self.state.peek_page(index, page_offset, &mut scratch) {
            let page_bytes: &[u8; PAGE_SIZE] = bytes.try_into().expect("peek returns whole pages");
            self.tree.update_page(start + page_offset, page_bytes);
        }
    }

    /// Root hash over the whole physical space, after syncing the tree.
    pub fn root_hash(&mut self) -> Hash {
        self.update_merkle_tree();
        self.tree.root_hash()
    }

    /// Merkle proof for the aligned range `[address, address + 2^log2_size)`.
    pub fn get_proof(&mut self, address: u64, log2_size: u32) -> Option<Proof> {
        self.update_merkle_tree();
        self.tree.get_proof(address, log2_size)
    }

    pub fn verify_proof(proof: &Proof) -> bool {
        MerkleTree::verify_proof(proof)
    }
}
