use strum_macros::{Display, EnumIter, EnumString};

/// Number of logical x86 register slots.
pub const NUM_REGISTERS: usize = 25;

/// Number of context words transferred by `getcontext`/`setcontext`.
pub const NATIVE_CONTEXT_WORDS: usize = 22;

/// Architecture neutral x86 register index. Discriminant is the slot number in [`RegisterMap`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Gs = 0,
    Fs,
    Es,
    Ds,
    Edi,
    Esi,
    Ebp,
    Esp,
    Ebx,
    Edx,
    Ecx,
    Eax,
    TrapNo,
    Err,
    Eip,
    Cs,
    Eflags,
    Uesp,
    Ss,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Dr7,
}

impl Register {
    pub const PC: Register = Register::Eip;
    pub const SP: Register = Register::Esp;
    pub const FP: Register = Register::Ebp;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Order of context words as the debug server sends them.
/// `TrapNo`, `Err` and `Uesp` have no native counterpart.
pub const CONTEXT_LAYOUT: [Register; NATIVE_CONTEXT_WORDS] = [
    Register::Eax,
    Register::Ebx,
    Register::Ecx,
    Register::Edx,
    Register::Esi,
    Register::Edi,
    Register::Ebp,
    Register::Esp,
    Register::Eip,
    Register::Ds,
    Register::Es,
    Register::Fs,
    Register::Gs,
    Register::Cs,
    Register::Ss,
    Register::Eflags,
    Register::Dr0,
    Register::Dr1,
    Register::Dr2,
    Register::Dr3,
    Register::Dr6,
    Register::Dr7,
];

/// Integer register set of a single thread.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct RegisterMap([u64; NUM_REGISTERS]);

impl RegisterMap {
    /// Remap context words from wire order.
    pub fn from_native(words: &[u64; NATIVE_CONTEXT_WORDS]) -> Self {
        let mut map = RegisterMap::default();
        CONTEXT_LAYOUT
            .iter()
            .zip(words)
            .for_each(|(reg, value)| map.update(*reg, *value));
        map
    }

    /// Remap registers into wire order.
    pub fn to_native(&self) -> [u64; NATIVE_CONTEXT_WORDS] {
        let mut words = [0u64; NATIVE_CONTEXT_WORDS];
        CONTEXT_LAYOUT
            .iter()
            .zip(words.iter_mut())
            .for_each(|(reg, word)| *word = self.value(*reg));
        words
    }

    pub fn value(&self, register: impl Into<Register>) -> u64 {
        self.0[register.into().index()]
    }

    pub fn update(&mut self, register: impl Into<Register>, value: u64) {
        self.0[register.into().index()] = value;
    }

    pub fn pc(&self) -> u64 {
        self.value(Register::PC)
    }

    pub fn set_pc(&mut self, value: u64) {
        self.update(Register::PC, value)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}
