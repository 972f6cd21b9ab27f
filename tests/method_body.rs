use jvm_insnlist::jvm::class_file::{ConstantIndex, ConstantPool, ConstantsPool, StackMapFrame};
use jvm_insnlist::jvm::class_graph::ClassTree;
use jvm_insnlist::jvm::code::*;
use jvm_insnlist::jvm::verifier::{infer_frames, Frame, VerificationType};
use jvm_insnlist::jvm::*;
use jvm_insnlist::util::Offset;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn static_method(descriptor: &str) -> MethodContext {
    MethodContext::new(
        "me/alec/Test",
        "test",
        MethodDescriptor::parse(descriptor).unwrap(),
        MethodAccessFlags::STATIC,
    )
}

/// Check that following `next` and following `prev` visit the same handles
fn assert_linked(list: &InstructionList) {
    let forward: Vec<InsnHandle> = list.iter().collect();
    let mut backward = vec![];
    let mut cursor = list.last();
    while let Some(handle) = cursor {
        backward.push(handle);
        cursor = list.prev(handle).unwrap();
    }
    backward.reverse();
    assert_eq!(forward, backward);
    assert_eq!(forward.len(), list.len());
    assert_eq!(list.first(), forward.first().copied());
    for pair in forward.windows(2) {
        assert_eq!(list.next(pair[0]).unwrap(), Some(pair[1]));
        assert_eq!(list.prev(pair[1]).unwrap(), Some(pair[0]));
    }
}

#[test]
fn edits_keep_the_list_linked() {
    init_logging();
    let mut list = InstructionList::new();
    let a = list.append(Instruction::IConst0).unwrap();
    let d = list.append(BranchInstruction::IReturn).unwrap();
    let b = list.append_after(a, Instruction::IConst1).unwrap();
    let c = list.insert_before(d, Instruction::IAdd).unwrap();
    let start = list.insert(Instruction::Nop).unwrap();
    assert_linked(&list);

    let mut other = InstructionList::new();
    other.append(Instruction::Nop).unwrap();
    other.append(Instruction::Nop).unwrap();
    list.insert_list_before(c, &mut other).unwrap();
    assert!(other.is_empty());
    assert_eq!(list.len(), 7);
    assert_linked(&list);

    list.delete(start).unwrap();
    list.delete_range(b, b).unwrap();
    assert_linked(&list);
    assert_eq!(list.first(), Some(a));
    assert!(!list.contains(b));

    assert!(matches!(
        list.append_list(&mut InstructionList::new()),
        Err(Error::EmptyList)
    ));
    assert_linked(&list);
}

#[test]
fn decoding_round_trips() {
    init_logging();
    let mut list = InstructionList::new();
    let first_return = list.append(BranchInstruction::Return).unwrap();
    let second_return = list.append(BranchInstruction::Return).unwrap();
    for insn in [
        Instruction::ILoad(1),
        Instruction::IStore(300),
        Instruction::IInc(300, 1000),
        Instruction::Ldc(ConstantIndex(300)),
        Instruction::Pop,
        Instruction::SiPush(-2),
        Instruction::ILoad(300),
    ] {
        list.insert_before(first_return, insn).unwrap();
    }
    let switch = SwitchBuilder::new(&[1, 1000], &[first_return, second_return], second_return)
        .unwrap()
        .build();
    list.insert_before(first_return, switch).unwrap();

    let bytes = list.to_bytes().unwrap();
    let mut decoded = InstructionList::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.len(), list.len());
    assert_eq!(decoded.to_bytes().unwrap(), bytes);

    let lookup = decoded.iter().nth(7).unwrap();
    assert!(matches!(
        decoded.get(lookup).unwrap(),
        ListInstruction::Branch(BranchInstruction::LookupSwitch { .. })
    ));
    let targets = decoded.targeters(decoded.last().unwrap()).unwrap();
    assert!(targets.contains(&Targeter::Branch(lookup)));
}

#[test]
fn hand_written_encodings_round_trip() {
    init_logging();
    for code in [
        vec![0x15, 0x00, 0xac],                         // iload 0; ireturn
        vec![0x13, 0x00, 0x01, 0xac],                   // ldc_w #1; ireturn
        vec![0xc4, 0x84, 0x00, 0x01, 0x00, 0x01, 0xb1], // wide iinc 1 1; return
        vec![0xc4, 0x15, 0x00, 0x03, 0xac],             // wide iload 3; ireturn
        vec![
            0x15, 0x00, // 0: iload 0
            0x99, 0x00, 0x06, // 2: ifeq +6
            0x13, 0x00, 0x01, // 5: ldc_w #1
            0x1a, // 8: iload_0
            0xac, // 9: ireturn
        ],
    ] {
        let mut list = InstructionList::from_bytes(&code).unwrap();
        assert_eq!(list.to_bytes().unwrap(), code);

        // Edits elsewhere in the list leave the encodings alone
        let first = list.first().unwrap();
        list.insert_before(first, Instruction::Nop).unwrap();
        let mut expected = vec![0x00];
        expected.extend_from_slice(&code);
        assert_eq!(list.to_bytes().unwrap(), expected);
    }
}

#[test]
fn resolution_is_idempotent() {
    init_logging();
    let mut list = InstructionList::new();
    list.append(Instruction::ILoad(0)).unwrap();
    let target = list.append(BranchInstruction::Return).unwrap();
    for _ in 0..32700 {
        list.insert_before(target, Instruction::Nop).unwrap();
    }
    let first = list.first().unwrap();
    list.append_after(first, BranchInstruction::If(OrdComparison::LT, target))
        .unwrap();
    list.append(BranchInstruction::Goto(first)).unwrap();

    list.set_positions(true).unwrap();
    let before: Vec<Offset> = list.iter().map(|h| list.position(h).unwrap()).collect();
    let bytes = list.encode().unwrap();
    list.set_positions(true).unwrap();
    let after: Vec<Offset> = list.iter().map(|h| list.position(h).unwrap()).collect();
    assert_eq!(before, after);
    assert_eq!(list.encode().unwrap(), bytes);
}

#[test]
fn lost_targets_can_be_redirected() {
    init_logging();
    let mut list = InstructionList::new();
    list.append(Instruction::IConst0).unwrap();
    let lost = list.append(BranchInstruction::Return).unwrap();
    let replacement = list.append(BranchInstruction::Return).unwrap();
    let first = list.first().unwrap();
    let jump = list
        .append_after(first, BranchInstruction::If(OrdComparison::EQ, lost))
        .unwrap();

    match list.delete(lost) {
        Err(Error::TargetLost(handles)) => assert_eq!(handles, vec![lost]),
        other => panic!("expected lost targets, got {:?}", other),
    }
    assert!(!list.contains(lost));
    assert!(list.targeters(lost).unwrap().contains(&Targeter::Branch(jump)));

    list.redirect_branches(lost, replacement).unwrap();
    list.delete(lost).unwrap();
    assert!(matches!(list.get(lost), Err(Error::InvalidHandle(_))));
    assert!(list
        .targeters(replacement)
        .unwrap()
        .contains(&Targeter::Branch(jump)));
    list.set_positions(true).unwrap();
    assert_eq!(list.code_length().unwrap(), Offset(5));
}

#[test]
fn switch_encoded_lengths() {
    init_logging();
    let mut list = InstructionList::new();
    let ret = list.append(BranchInstruction::Return).unwrap();
    let table = SwitchBuilder::new(&[0, 1, 2], &[ret, ret, ret], ret)
        .unwrap()
        .build();
    let switch = list.insert_before(ret, table).unwrap();
    list.set_positions(true).unwrap();
    assert_eq!(list.position(ret).unwrap(), Offset(1 + 3 + 12 + 4 * 3));

    let lookup = SwitchBuilder::new(&[0, 100, 10000], &[ret, ret, ret], ret)
        .unwrap()
        .build();
    list.set_instruction(switch, lookup).unwrap();
    list.set_positions(true).unwrap();
    assert_eq!(list.position(ret).unwrap(), Offset(1 + 3 + 8 + 8 * 3));

    list.insert(Instruction::ILoad(0)).unwrap();
    list.set_positions(true).unwrap();
    assert_eq!(list.position(ret).unwrap(), Offset(1 + 1 + 2 + 8 + 8 * 3));

    assert!(matches!(
        list.set_instruction(switch, Instruction::Nop),
        Err(Error::HandleKindMismatch { branch: true, .. })
    ));
}

#[test]
fn straight_line_frames() {
    init_logging();
    let mut list = InstructionList::new();
    list.append(Instruction::ILoad(0)).unwrap();
    list.append(Instruction::ILoad(1)).unwrap();
    list.append(Instruction::IAdd).unwrap();
    list.append(Instruction::I2L).unwrap();
    list.append(Instruction::LStore(2)).unwrap();
    list.append(Instruction::ILoad(0)).unwrap();
    list.append(BranchInstruction::IReturn).unwrap();

    let mut constants = ConstantsPool::new();
    let generated = MethodCode::new(list)
        .generate(&static_method("(II)I"), &mut constants, &ClassTree::new())
        .unwrap();
    assert_eq!(generated.max_stack, 2);
    assert_eq!(generated.max_locals, 4);
    assert!(generated.stack_map.0.is_empty());
    assert_eq!(
        generated.code,
        vec![0x1a, 0x1b, 0x60, 0x85, 0x41, 0x1a, 0xac]
    );
}

#[test]
fn merged_frames_are_sound() {
    init_logging();
    // return flag ? string : integer;
    let mut list = InstructionList::new();
    list.append(Instruction::ILoad(2)).unwrap();
    let join = list.append(BranchInstruction::AReturn).unwrap();
    let else_start = list.insert_before(join, Instruction::ALoad(1)).unwrap();
    let then_start = list
        .insert_before(else_start, Instruction::ALoad(0))
        .unwrap();
    list.insert_before(else_start, BranchInstruction::Goto(join))
        .unwrap();
    list.insert_before(
        then_start,
        BranchInstruction::If(OrdComparison::EQ, else_start),
    )
    .unwrap();

    let method = static_method("(Ljava/lang/String;Ljava/lang/Integer;Z)Ljava/lang/Object;");
    let mut constants = ConstantsPool::new();
    let generated = MethodCode::new(list)
        .generate(&method, &mut constants, &ClassTree::new())
        .unwrap();
    assert_eq!(generated.max_stack, 1);
    assert_eq!(generated.max_locals, 3);

    let string = constants.add_class("java/lang/String").unwrap();
    let integer = constants.add_class("java/lang/Integer").unwrap();
    let object = constants.add_class(RefType::OBJECT_NAME).unwrap();
    let locals = vec![
        VerificationType::Object(string),
        VerificationType::Object(integer),
        VerificationType::Integer,
    ];
    assert_eq!(
        generated.stack_map.0,
        vec![
            StackMapFrame {
                offset_delta: 4,
                locals: locals.clone(),
                stack: vec![],
            },
            StackMapFrame {
                offset_delta: 3,
                locals: locals.clone(),
                stack: vec![],
            },
            StackMapFrame {
                offset_delta: 0,
                locals,
                stack: vec![VerificationType::Object(object)],
            },
        ]
    );
}

#[test]
fn far_jumps_round_trip() {
    init_logging();
    let mut list = InstructionList::new();
    let target = list.append(BranchInstruction::Return).unwrap();
    for _ in 0..40000 {
        list.insert_before(target, Instruction::Nop).unwrap();
    }
    let jump = list.insert(BranchInstruction::Goto(target)).unwrap();
    list.set_positions(true).unwrap();
    assert!(list.is_widened(jump).unwrap());
    assert_eq!(list.position(target).unwrap(), Offset(5 + 40000));

    let bytes = list.encode().unwrap();
    assert_eq!(&bytes[0..5], &[0xc8, 0, 0, 0x9c, 0x45]);

    let mut decoded = InstructionList::from_bytes(&bytes).unwrap();
    let decoded_jump = decoded.first().unwrap();
    assert!(matches!(
        decoded.get(decoded_jump).unwrap(),
        ListInstruction::Branch(BranchInstruction::GotoW(_))
    ));
    assert_eq!(decoded.to_bytes().unwrap(), bytes);
}

#[test]
fn copies_remap_jumps_but_not_records() {
    init_logging();
    let mut list = InstructionList::new();
    list.append(Instruction::ILoad(0)).unwrap();
    let ret = list.append(BranchInstruction::Return).unwrap();
    let first = list.first().unwrap();
    let jump = list
        .append_after(first, BranchInstruction::If(OrdComparison::NE, ret))
        .unwrap();
    let mut code = MethodCode::new(list);
    code.add_line_number(ret, 10).unwrap();

    let (copy, map) = code.instructions.copy_with_map().unwrap();
    assert_eq!(copy.len(), 3);
    assert_ne!(copy.id(), code.instructions.id());
    match copy.get(map[&jump]).unwrap() {
        ListInstruction::Branch(BranchInstruction::If(OrdComparison::NE, target)) => {
            assert_eq!(*target, map[&ret])
        }
        other => panic!("unexpected copied instruction {:?}", other),
    }
    let copied_targeters = copy.targeters(map[&ret]).unwrap();
    assert_eq!(copied_targeters.len(), 1);
    assert!(copied_targeters.contains(&Targeter::Branch(map[&jump])));

    // The source list is untouched
    assert_eq!(code.instructions.targeters(ret).unwrap().len(), 2);
    assert!(matches!(copy.get(ret), Err(Error::InvalidHandle(_))));
}

#[test]
fn moving_ranges() {
    init_logging();
    let mut list = InstructionList::new();
    let a = list.append(Instruction::IConst0).unwrap();
    let b = list.append(Instruction::IConst1).unwrap();
    let c = list.append(Instruction::IConst2).unwrap();
    let d = list.append(BranchInstruction::Return).unwrap();

    list.move_range(b, c, None).unwrap();
    assert_eq!(list.iter().collect::<Vec<_>>(), vec![b, c, a, d]);
    assert_linked(&list);

    list.move_range(b, c, Some(a)).unwrap();
    assert_eq!(list.iter().collect::<Vec<_>>(), vec![a, b, c, d]);
    assert_linked(&list);

    assert!(matches!(
        list.move_range(a, c, Some(b)),
        Err(Error::MoveIntoRange(_))
    ));
    assert!(matches!(
        list.move_range(c, a, None),
        Err(Error::InvalidRange { .. })
    ));
    assert_eq!(list.iter().collect::<Vec<_>>(), vec![a, b, c, d]);
}

#[test]
fn exception_handler_frames() {
    init_logging();
    let mut constants = ConstantsPool::new();
    let exception = constants.add_class("java/lang/ArithmeticException").unwrap();

    let mut list = InstructionList::new();
    let start = list.append(Instruction::IConst1).unwrap();
    list.append(Instruction::IConst0).unwrap();
    let end = list.append(Instruction::IDiv).unwrap();
    list.append(BranchInstruction::IReturn).unwrap();
    let handler = list.append(Instruction::AStore(0)).unwrap();
    list.append(Instruction::IConstM1).unwrap();
    list.append(BranchInstruction::IReturn).unwrap();

    let mut code = MethodCode::new(list);
    code.add_exception_handler(start, end, handler, Some(exception))
        .unwrap();
    let mut tree = ClassTree::new();
    tree.add_class("java/lang/ArithmeticException", "java/lang/RuntimeException");
    let generated = code
        .generate(&static_method("()I"), &mut constants, &tree)
        .unwrap();

    assert_eq!(generated.max_stack, 2);
    assert_eq!(generated.max_locals, 1);
    assert_eq!(generated.exception_table.len(), 1);
    let entry = generated.exception_table[0];
    assert_eq!(
        (entry.start_pc, entry.end_pc, entry.handler_pc, entry.catch_type),
        (0, 3, 4, exception.0)
    );
    assert_eq!(
        generated.stack_map.0.last(),
        Some(&StackMapFrame {
            offset_delta: 0,
            locals: vec![],
            stack: vec![VerificationType::Object(exception)],
        })
    );

    let attribute = generated.into_code_attribute(&mut constants).unwrap();
    assert_eq!(attribute.attributes.len(), 1);
    assert_eq!(
        constants.get_utf8(attribute.attributes[0].name_index),
        Some("StackMapTable")
    );
}

#[test]
fn constant_stored_then_returned() {
    init_logging();
    let mut list = InstructionList::new();
    list.append(Instruction::IConst1).unwrap();
    list.append(Instruction::IStore(1)).unwrap();
    list.append(Instruction::ILoad(1)).unwrap();
    list.append(BranchInstruction::IReturn).unwrap();
    list.set_positions(true).unwrap();

    let method = static_method("()I");
    let constants = ConstantsPool::new();
    let cfg = ControlFlowGraph::partition(&list, &[]).unwrap();
    let hierarchy = ClassTree::new();
    let inferred = infer_frames(&list, &cfg, &[], &method, &constants, &hierarchy).unwrap();
    assert_eq!(inferred.entry_frames, vec![Some(Frame::default())]);
    assert_eq!(inferred.max_stack, 1);
    assert_eq!(inferred.max_locals, 2);

    let mut frame = Frame::entry(&method).unwrap();
    let mut depths = vec![];
    for (handle, insn) in list.instructions() {
        match insn {
            ListInstruction::Straight(insn) => frame
                .interpret_instruction(insn, handle, &method, &constants)
                .unwrap(),
            ListInstruction::Branch(branch) => frame
                .interpret_branch_instruction(branch, &method)
                .unwrap(),
        }
        depths.push(frame.stack.len());
    }
    assert_eq!(depths, vec![1, 0, 1, 0]);
    assert_eq!(frame.locals.get(&1), Some(&VerificationType::Integer));
}

#[test]
fn lists_are_independent_across_threads() {
    init_logging();
    let edit = |seed: i16| {
        std::thread::spawn(move || {
            let mut list = InstructionList::new();
            let ret = list.append(BranchInstruction::Return).unwrap();
            for i in 0..200 {
                list.insert_before(ret, Instruction::SiPush(seed + i)).unwrap();
                list.insert_before(ret, Instruction::Pop).unwrap();
            }
            for _ in 0..50 {
                let start = list.first().unwrap();
                let end = list.next(start).unwrap().unwrap();
                list.delete_range(start, end).unwrap();
            }
            for _ in 0..50 {
                let start = list.first().unwrap();
                let end = list.next(start).unwrap().unwrap();
                let target = list.prev(ret).unwrap();
                list.move_range(start, end, target).unwrap();
            }
            let mut other = InstructionList::new();
            other.append(Instruction::IConst0).unwrap();
            other.append(Instruction::Pop).unwrap();
            list.insert_list_before(ret, &mut other).unwrap();
            assert!(other.is_empty());
            list
        })
    };
    let left = edit(0);
    let right = edit(1000);
    let left = left.join().unwrap();
    let right = right.join().unwrap();

    assert_ne!(left.id(), right.id());
    for list in [&left, &right] {
        assert_linked(list);
        assert_eq!(list.len(), 2 * 150 + 2 + 1);
        for handle in list.iter() {
            assert_eq!(handle.list_id(), list.id());
        }
    }
    assert!(matches!(
        left.get(right.first().unwrap()),
        Err(Error::InvalidHandle(_))
    ));
}
