//! Human-readable program dumps.

use std::collections::HashMap;
use std::fmt;

use crate::instruction::{EventMask, InsId};
use crate::program::Program;

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position: HashMap<InsId, usize> =
            self.iter().enumerate().map(|(n, id)| (id, n)).collect();
        for (ndx, id) in self.iter().enumerate() {
            let ins = &self[id];
            write!(f, "@{ndx} = {}(", ins.op)?;
            for (i, arg) in ins.inputs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                match position.get(arg) {
                    Some(p) => write!(f, "@{p}")?,
                    None => f.write_str("@?")?,
                }
            }
            write!(f, ") -> {}", ins.shape)?;
            if let Some(s) = ins.stream {
                write!(f, " stream={s}")?;
            }
            if ins.has_mask(EventMask::RECORD_EVENT) {
                f.write_str(" +record")?;
            }
            if ins.has_mask(EventMask::WAIT_EVENT) {
                f.write_str(" +wait")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
