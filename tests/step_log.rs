//! Step logging, replay verification, and tamper rejection.

mod common;

use common::*;
use veriscv::access::{AccessError, AccessType, LogType};
use veriscv::Machine;

fn test_program() -> Vec<u8> {
    let target = 0x80001000u64;
    let mut program = vec![addi(1, 0, 5), addi(2, 1, 7), add(3, 1, 2)];
    program.extend(li_ram_addr(4, target));
    program.push(sd(3, 4, 0));
    program.push(ld(T0, 4, 0));
    program.extend(halt_sequence());
    boot_image(&program, &[])
}

#[test]
fn step_matches_run_in_lockstep() {
    let mut stepped = machine_with_image(test_program());
    let mut ran = machine_with_image(test_program());

    for cycle in 1..=12u64 {
        let log = stepped.step(LogType::with_proofs());
        assert!(!log.accesses.is_empty());
        ran.run(cycle);

        assert_eq!(stepped.read_mcycle(), ran.read_mcycle(), "cycle {cycle}");
        assert_eq!(stepped.state().pc, ran.state().pc, "cycle {cycle}");
        assert_eq!(stepped.state().x, ran.state().x, "cycle {cycle}");
        assert_eq!(stepped.state().minstret, ran.state().minstret);
        assert_eq!(stepped.root_hash(), ran.root_hash(), "cycle {cycle}");
    }
}

#[test]
fn log_replays_to_the_post_step_root() {
    let mut machine = machine_with_image(test_program());
    let initial_root = machine.root_hash();

    for _ in 0..8 {
        let log = machine.step(LogType::with_proofs());
        let replayed_root = Machine::verify_access_log(&log, true).expect("log verifies");
        assert_eq!(replayed_root, machine.root_hash());
    }
    assert_ne!(machine.root_hash(), initial_root);
}

#[test]
fn annotated_log_carries_brackets_and_notes() {
    let mut machine = machine_with_image(test_program());
    let log = machine.step(LogType::full());
    assert!(log.log_type.annotations);
    assert!(log.brackets.iter().any(|b| b.text == "step"));
    assert!(log.accesses.iter().all(|access| access.note.is_some()));
    // Annotations must not affect verification.
    Machine::verify_access_log(&log, true).expect("log verifies");
}

#[test]
fn replay_without_proof_checking_still_checks_shape() {
    let mut machine = machine_with_image(test_program());
    let log = machine.step(LogType::with_proofs());
    Machine::verify_access_log(&log, false).expect("shape-only replay");
}

#[test]
fn truncated_log_is_too_short() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    log.accesses.pop();
    assert!(matches!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::TooFewAccesses { .. })
    ));
}

#[test]
fn padded_log_is_too_long() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    let extra = log.accesses.last().unwrap().clone();
    log.accesses.push(extra);
    let count = log.accesses.len();
    assert_eq!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::TooManyAccesses { count, consumed: count - 1 })
    );
}

#[test]
fn flipped_access_type_is_rejected() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    log.accesses[0].access_type = AccessType::Write;
    assert!(matches!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::TypeMismatch { index: 1, .. })
    ));
}

#[test]
fn wrong_address_is_rejected() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    log.accesses[0].address += 8;
    assert!(matches!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::AddressMismatch { index: 1, .. })
    ));
}

#[test]
fn forged_read_value_fails_the_target_hash() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    log.accesses[0].read ^= 1;
    log.accesses[0].written ^= 1;
    assert!(matches!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::TargetHashMismatch { index: 1 })
    ));
}

#[test]
fn forged_root_hash_breaks_the_chain() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    let proof = log.accesses[1].proof.as_mut().unwrap();
    proof.root_hash[0] ^= 1;
    assert!(matches!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::RootHashMismatch { index: 2 })
    ));
}

#[test]
fn forged_written_value_is_rejected() {
    let mut machine = machine_with_image(test_program());
    let mut log = machine.step(LogType::with_proofs());
    let target = log
        .accesses
        .iter()
        .position(|access| access.access_type == AccessType::Write)
        .expect("a step always writes mcycle");
    log.accesses[target].written ^= 1;
    let err = Machine::verify_access_log(&log, true).unwrap_err();
    assert!(
        matches!(err, AccessError::WrittenValueMismatch { .. }),
        "got {err:?}"
    );
}

#[test]
fn proofless_log_cannot_be_proof_verified() {
    let mut machine = machine_with_image(test_program());
    let log = machine.step(LogType::default());
    assert!(matches!(
        Machine::verify_access_log(&log, true),
        Err(AccessError::MissingProofs)
    ));
    // Without proof checking it replays fine.
    Machine::verify_access_log(&log, false).expect("shape-only replay");
}

#[test]
fn step_state_equals_run_state_after_interrupt_delivery() {
    use veriscv::cpu::csr::{MIP_MTIP, MSTATUS_MIE};

    let build = || {
        let image = boot_image(&[jal(0, 0)], &halt_sequence());
        let mut machine = machine_with_image(image);
        let state = machine.state_mut();
        state.clint.mtimecmp = 0; // expired immediately
        state.mip |= MIP_MTIP;
        state.mstatus |= MSTATUS_MIE;
        state.mie |= MIP_MTIP;
        state.mtvec = RAM_START + 0x100;
        state.set_brk_from_all();
        machine
    };

    let mut stepped = build();
    let log = stepped.step(LogType::with_proofs());
    let replayed_root = Machine::verify_access_log(&log, true).expect("interrupt step verifies");
    assert_eq!(replayed_root, stepped.root_hash());

    let mut ran = build();
    ran.run(1);
    assert_eq!(stepped.state().pc, ran.state().pc);
    assert_eq!(stepped.state().mcause, ran.state().mcause);
    assert_eq!(stepped.root_hash(), ran.root_hash());
}
