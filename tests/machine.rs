//! End-to-end machine scenarios: boot, timer interrupts, LR/SC, Merkle
//! commitments.

mod common;

use common::*;
use veriscv::cpu::csr::{
    CAUSE_INTERRUPT_FLAG, IRQ_M_TIMER, MIP_MTIP, MSTATUS_MIE,
};
use veriscv::merkle::{hash_word, MerkleTree};
use veriscv::{Machine, MachineConfig, MachineError, RunStatus};

#[test]
fn boot_trampoline_reaches_ram_and_halts() {
    let mut program = halt_sequence();
    // Drop a marker in a0 first so we know RAM code really ran.
    program.insert(0, addi(A0, 0, 42));
    let mut machine = machine_with_image(boot_image(&program, &[]));

    let status = machine.run(10_000);
    assert_eq!(status, RunStatus::Halted);
    assert!(machine.halted());
    assert!(machine.read_mcycle() < 10_000);
    assert_eq!(machine.state().x[A0 as usize], 42);
    // The trampoline passed the device tree address in a1.
    assert_eq!(machine.state().x[A1 as usize], 0x1000 + 8 * 8);
}

#[test]
fn run_reaches_cycle_target_on_busy_loop() {
    // An infinite loop never halts; run returns at the target.
    let mut machine = machine_with_image(boot_image(&[jal(0, 0)], &[]));
    let status = machine.run(1_000);
    assert_eq!(status, RunStatus::Done);
    assert_eq!(machine.read_mcycle(), 1_000);
    assert!(!machine.halted());
}

#[test]
fn clint_timer_interrupt_fires() {
    // Busy loop at RAM start; the timer handler halts the machine.
    let image = boot_image(&[jal(0, 0)], &halt_sequence());
    let mut machine = machine_with_image(image);
    {
        let state = machine.state_mut();
        state.clint.mtimecmp = 50;
        state.mstatus |= MSTATUS_MIE;
        state.mie |= MIP_MTIP;
        state.mtvec = RAM_START + 0x100;
    }

    let status = machine.run(10_000_000);
    assert_eq!(status, RunStatus::Halted);
    // time = mcycle / 100, so mtimecmp = 50 expires at mcycle 5000.
    assert!(machine.read_mcycle() >= 5_000);
    assert_eq!(machine.state().mcause, CAUSE_INTERRUPT_FLAG | IRQ_M_TIMER);
    assert_ne!(machine.state().mip & MIP_MTIP, 0);
}

#[test]
fn wfi_skips_idle_time() {
    // WFI parks the CPU long before the timer expires; the run loop must
    // fast-forward instead of spinning a million cycles.
    let image = boot_image(&[wfi(), jal(0, 0)], &halt_sequence());
    let mut machine = machine_with_image(image);
    {
        let state = machine.state_mut();
        state.clint.mtimecmp = 1_000;
        state.mstatus |= MSTATUS_MIE;
        state.mie |= MIP_MTIP;
        state.mtvec = RAM_START + 0x100;
    }
    let status = machine.run(u64::MAX >> 1);
    assert_eq!(status, RunStatus::Halted);
    assert!(machine.read_mcycle() >= 100_000);
    assert_eq!(machine.state().mcause, CAUSE_INTERRUPT_FLAG | IRQ_M_TIMER);
}

#[test]
fn lr_sc_succeeds_back_to_back() {
    let target = 0x80001000u64; // a RAM address clear of the code
    let mut program = li_ram_addr(2, target);
    program.push(addi(4, 0, 77));
    program.push(lr_d(1, 2));
    program.push(sc_d(3, 2, 4));
    program.extend(halt_sequence());
    let mut machine = machine_with_image(boot_image(&program, &[]));

    assert_eq!(machine.run(10_000), RunStatus::Halted);
    assert_eq!(machine.state().x[3], 0, "sc must succeed");
    assert_eq!(machine.read_word(target), Some(77));
}

#[test]
fn sc_survives_store_to_other_address() {
    let target = 0x80001000u64;
    let scratch = 0x80002000u64;
    let mut program = li_ram_addr(2, target);
    program.extend(li_ram_addr(T2, scratch));
    program.push(addi(4, 0, 77));
    program.push(lr_d(1, 2));
    program.push(sd(4, T2, 0)); // intervening store elsewhere
    program.push(sc_d(3, 2, 4));
    program.extend(halt_sequence());
    let mut machine = machine_with_image(boot_image(&program, &[]));

    assert_eq!(machine.run(10_000), RunStatus::Halted);
    assert_eq!(machine.state().x[3], 0, "store to another address keeps the reservation");
}

#[test]
fn trap_between_lr_and_sc_fails_sc() {
    let target = 0x80001000u64;
    // Handler: skip the faulting instruction and return.
    let handler = vec![
        csrrs(T2, 0x341, 0),  // csrr t2, mepc
        addi(T2, T2, 4),
        csrrw(0, 0x341, T2),  // csrw mepc, t2
        mret(),
    ];
    let mut program = li_ram_addr(2, target);
    program.push(addi(4, 0, 77));
    program.push(lr_d(1, 2));
    program.push(ecall());
    program.push(sc_d(3, 2, 4));
    program.extend(halt_sequence());
    let mut machine = machine_with_image(boot_image(&program, &handler));
    machine.state_mut().mtvec = RAM_START + 0x100;

    assert_eq!(machine.run(10_000), RunStatus::Halted);
    assert_eq!(machine.state().x[3], 1, "trap must invalidate the reservation");
    assert_eq!(machine.read_word(target), Some(0));
}

#[test]
fn merkle_single_word_update() {
    let mut machine = machine_with_image(boot_image(&[jal(0, 0)], &[]));
    machine
        .host_write(0x8000_0000, &0xDEADBEEF_CAFEBABEu64.to_le_bytes())
        .unwrap();

    let proof = machine.get_proof(0x8000_0000, 3).unwrap();
    assert_eq!(proof.target_hash, hash_word(0xDEADBEEF_CAFEBABE));
    assert!(Machine::verify_proof(&proof));
    assert_eq!(proof.root_hash, machine.root_hash());
}

#[test]
fn proofs_verify_at_all_granularities() {
    let mut machine = machine_with_image(boot_image(&halt_sequence(), &[]));
    machine.run(100);
    for log2 in [3, 4, 8, 12, 20, 31, 48, 63, 64] {
        let address = if log2 >= 64 { 0 } else { 0x8000_0000u64 & !((1u64 << log2) - 1) };
        let proof = machine.get_proof(address, log2).unwrap();
        assert!(MerkleTree::verify_proof(&proof), "log2_size {log2}");
    }
}

#[test]
fn shadow_page_projects_live_state() {
    let mut machine = machine_with_image(boot_image(&halt_sequence(), &[]));
    machine.run(3);
    // The shadow word for pc must equal the live pc.
    let pc = machine.state().pc;
    assert_eq!(machine.read_word(0x100), Some(pc));
    // And the first PMA descriptor pair must describe RAM.
    let istart = machine.read_word(0x800).unwrap();
    assert_eq!(istart & !0xFFF, 0x8000_0000);
    assert_eq!(machine.read_word(0x808), Some(4 << 20));
}

#[test]
fn yield_breaks_run_and_resumes() {
    // Write (2 << 56) to tohost: yield device, manual command.
    let mut program = vec![
        lui(T0, 0x40008),
        addi(T1, 0, 2),
        slli(T1, T1, 56),
        sd(T1, T0, 0),
    ];
    program.extend(halt_sequence());
    let mut machine = machine_with_image(boot_image(&program, &[]));

    assert_eq!(machine.run(10_000), RunStatus::Yielded);
    assert!(machine.yielded());
    assert!(!machine.halted());

    // Running again resumes past the yield and reaches the halt.
    assert_eq!(machine.run(10_000), RunStatus::Halted);
    assert!(!machine.yielded());
}

#[test]
fn ungated_yield_is_ignored() {
    let mut program = vec![
        lui(T0, 0x40008),
        addi(T1, 0, 2),
        slli(T1, T1, 56),
        sd(T1, T0, 0),
    ];
    program.extend(halt_sequence());
    let mut config = MachineConfig::new(4 << 20).with_boot_image(boot_image(&program, &[]));
    config.htif.iyield = 0;
    let mut machine = Machine::new(config).unwrap();

    assert_eq!(machine.run(10_000), RunStatus::Halted);
    assert!(!machine.yielded());
}

#[test]
fn oversized_device_tree_fails_construction() {
    let mut config = MachineConfig::new(4 << 20).with_boot_image(boot_image(&[jal(0, 0)], &[]));
    config.cmdline = "x".repeat(64 << 10);
    assert!(matches!(
        Machine::new(config),
        Err(MachineError::FdtOverflow { .. })
    ));
}

#[test]
fn construction_rejects_bad_configs() {
    assert!(matches!(
        Machine::new(MachineConfig::new(4 << 20)),
        Err(MachineError::MissingBootImage)
    ));
    assert!(matches!(
        Machine::new(MachineConfig::new(0x123).with_boot_image(vec![0; 4])),
        Err(MachineError::InvalidRamSize { .. })
    ));
    assert!(matches!(
        Machine::new(MachineConfig::new(0x1000).with_boot_image(vec![0; 0x2000])),
        Err(MachineError::BootImageTooBig { .. })
    ));
}

#[test]
fn flash_drive_maps_backing_file() {
    let dir = std::env::temp_dir().join("veriscv-flash-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("drive.bin");
    let mut content = vec![0u8; 0x2000];
    content[0..8].copy_from_slice(&0x1234_5678u64.to_le_bytes());
    std::fs::write(&path, &content).unwrap();

    let mut config = MachineConfig::new(4 << 20).with_boot_image(boot_image(&[jal(0, 0)], &[]));
    config.flash.push(veriscv::FlashConfig {
        start: 0x9000_0000,
        length: 0x2000,
        backing: path.clone(),
        label: "drive".into(),
        shared: false,
    });
    let machine = Machine::new(config).unwrap();
    assert_eq!(machine.read_word(0x9000_0000), Some(0x1234_5678));

    // Size mismatch fails construction.
    let mut config = MachineConfig::new(4 << 20).with_boot_image(boot_image(&[jal(0, 0)], &[]));
    config.flash.push(veriscv::FlashConfig {
        start: 0x9000_0000,
        length: 0x3000,
        backing: path,
        label: "drive".into(),
        shared: false,
    });
    assert!(matches!(
        Machine::new(config),
        Err(MachineError::BackingSizeMismatch { .. })
    ));
}
