//! Byte offsets into host VM structures.
//!
//! The emitter never sees the host VM's struct definitions; it addresses
//! thread-context, frame, compile-unit, and object memory purely through the
//! offsets collected here. The embedder fills this table in from its own
//! layout (in C terms, a struct of `offsetof` constants) and hands it to the
//! emitter.

/// Byte offsets of the host VM fields the emitter dereferences.
///
/// All offsets are relative to the start of the named structure. The
/// `Default` values describe a small example layout used by the tests;
/// embedders must supply their real layout.
#[derive(Debug, Clone, Copy)]
pub struct VmOffsets {
    /// Thread context: pointer to the interpreter's current compile unit
    /// (a pointer to a pointer; the emitter dereferences it once more).
    pub tc_interp_cu: i32,
    /// Thread context: pointer to the currently executing frame.
    pub tc_cur_frame: i32,
    /// Thread context: pointer to the VM instance.
    pub tc_instance: i32,
    /// Frame: base of the register file ("work" registers).
    pub frame_work: i32,
    /// Frame: base of the argument buffer.
    pub frame_args: i32,
    /// Frame: base of the lexical environment.
    pub frame_env: i32,
    /// Compile unit body: the string table.
    pub cu_strings: i32,
    /// Object: start of the object body.
    pub obj_body: i32,
    /// Object body: the "replaced" redirection pointer. Non-zero means the
    /// body has been relocated (mixin) and accesses must go through it.
    pub body_replaced: i32,
    /// Collectable header: the GC flags word.
    pub collectable_flags: i32,
    /// Instance: the VM null singleton.
    pub instance_vm_null: i32,
    /// Bit within the collectable flags word marking a second-generation
    /// (tenured) object.
    pub second_gen_flag: u16,
}

impl Default for VmOffsets {
    fn default() -> Self {
        Self {
            tc_interp_cu: 0x40,
            tc_cur_frame: 0x48,
            tc_instance: 0x50,
            frame_work: 0x60,
            frame_args: 0x68,
            frame_env: 0x70,
            cu_strings: 0x30,
            obj_body: 0x10,
            body_replaced: 0x08,
            collectable_flags: 0x0c,
            instance_vm_null: 0x20,
            second_gen_flag: 0x0002,
        }
    }
}

/// Addresses of host routines the emitted code calls back into.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFunctions {
    /// `write_barrier_hit(tc, target)`: invoked when a second-generation
    /// object is made to reference a younger one.
    pub write_barrier_hit: u64,
}
