//! Serialized trace of instruction sequences.
//!
//! The trace is a JSON array shaped like YARV's `to_a` output:
//!
//! ```text
//! ["GarnetInstructionSequence/SimpleDataFormat", name, kind, max_stack,
//!  locals, args, catch_table, body]
//! ```
//!
//! Labels appear in the body as `"label_N"` strings between instructions.

use serde_json::{Value as Json, json};

use crate::code::{ArgsDescriptor, BodyItem, CatchEntry, InstructionSequence};
use crate::opcode::{CallInfo, Instruction, Literal};

/// First element of every trace.
pub const TRACE_MAGIC: &str = "GarnetInstructionSequence/SimpleDataFormat";

impl InstructionSequence {
    /// Render this sequence and its children as a JSON trace.
    pub fn to_trace(&self) -> Json {
        let body: Vec<Json> = self
            .body()
            .into_iter()
            .map(|item| match item {
                BodyItem::Label(l) => Json::String(l.to_string()),
                BodyItem::Instruction(insn) => instruction_trace(insn),
            })
            .collect();

        json!([
            TRACE_MAGIC,
            self.name,
            self.kind.as_str(),
            self.max_stack,
            self.locals,
            args_trace(&self.args),
            self.catch_table.iter().map(catch_trace).collect::<Vec<_>>(),
            body,
        ])
    }
}

fn args_trace(args: &ArgsDescriptor) -> Json {
    let mut obj = serde_json::Map::new();
    if args.required > 0 {
        obj.insert("lead_num".into(), json!(args.required));
    }
    if args.optional > 0 {
        obj.insert("opt_num".into(), json!(args.optional));
        let labels: Vec<String> = args.opt_labels.iter().map(|l| l.to_string()).collect();
        obj.insert("opt".into(), json!(labels));
    }
    obj.insert("rest_start".into(), json!(slot_or_minus_one(args.rest)));
    obj.insert("block_start".into(), json!(slot_or_minus_one(args.block)));
    Json::Object(obj)
}

fn slot_or_minus_one(slot: Option<usize>) -> i64 {
    slot.map_or(-1, |s| s as i64)
}

fn catch_trace(entry: &CatchEntry) -> Json {
    json!([
        entry.kind.to_string(),
        entry.iseq.as_ref().map(|i| i.to_trace()),
        entry.start.to_string(),
        entry.end.to_string(),
        entry.cont.to_string(),
        entry.sp,
    ])
}

fn literal_trace(lit: &Literal) -> Json {
    match lit {
        Literal::Integer(n) => json!(n),
        Literal::Float(n) => json!(n),
        Literal::Bool(b) => json!(b),
        Literal::Symbol(s) => json!(format!(":{}", s)),
    }
}

fn call_trace(ci: &CallInfo) -> Json {
    json!({
        "mid": &*ci.name,
        "argc": ci.argc,
        "flag": ci.flags.to_string(),
    })
}

fn instruction_trace(insn: &Instruction) -> Json {
    let op = insn.mnemonic();
    match insn {
        Instruction::PutObject(lit) => json!([op, literal_trace(lit)]),
        Instruction::PutString(s) => json!([op, &**s]),
        Instruction::PutSpecialObject(obj) => json!([op, obj.to_string()]),
        Instruction::PutIseq(iseq) => json!([op, iseq.to_trace()]),
        Instruction::NewArray(n) => json!([op, n]),
        Instruction::GetLocal { index, level } | Instruction::SetLocal { index, level } => {
            json!([op, index, level])
        }
        Instruction::GetInstanceVariable(n)
        | Instruction::SetInstanceVariable(n)
        | Instruction::GetConstant(n)
        | Instruction::SetConstant(n) => json!([op, format!(":{}", n)]),
        Instruction::DefineClass { name, iseq, kind } => {
            json!([op, format!(":{}", name), iseq.to_trace(), kind.as_u8()])
        }
        Instruction::DefineMethod { name, singleton } => {
            json!([op, format!(":{}", name), singleton])
        }
        Instruction::Send(ci) | Instruction::InvokeSuper(ci) => json!([
            op,
            call_trace(ci),
            ci.block.as_ref().map(|b| b.to_trace())
        ]),
        Instruction::InvokeBlock { argc } => json!([op, argc]),
        Instruction::Jump(l) | Instruction::BranchIf(l) | Instruction::BranchUnless(l) => {
            json!([op, l.to_string()])
        }
        Instruction::Throw(kind) => json!([op, kind.to_string()]),
        _ => json!([op]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{IseqBuilder, IseqKind, Label};

    #[test]
    fn test_trace_shape() {
        let mut b = IseqBuilder::new("<main>", IseqKind::Top);
        b.add_local("a");
        b.emit(Instruction::PutObject(Literal::Integer(1)));
        b.emit(Instruction::SetLocal { index: 0, level: 0 });
        b.place(Label(0));
        b.emit(Instruction::GetLocal { index: 0, level: 0 });
        b.emit(Instruction::Leave);
        let trace = b.finish().unwrap().to_trace();

        assert_eq!(trace[0], TRACE_MAGIC);
        assert_eq!(trace[1], "<main>");
        assert_eq!(trace[2], "top");
        assert_eq!(trace[3], 1);
        assert_eq!(trace[4], json!(["a"]));
        assert_eq!(trace[5]["rest_start"], -1);
        assert_eq!(
            trace[7],
            json!([
                ["putobject", 1],
                ["setlocal", 0, 0],
                "label_0",
                ["getlocal", 0, 0],
                ["leave"]
            ])
        );
    }

    #[test]
    fn test_send_trace() {
        let mut ci = CallInfo::new("puts", 1);
        ci.flags.fcall = true;
        assert_eq!(
            instruction_trace(&Instruction::Send(ci)),
            json!(["send", {"mid": "puts", "argc": 1, "flag": "FCALL"}, null])
        );
    }
}
