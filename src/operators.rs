//! Operator precedence and associativity table for binary operators.

use std::collections::HashMap;

pub use crate::ast::Associativity;
use crate::ast::BinOp;

/// Information about an operator's fixity
#[derive(Debug, Clone)]
pub struct OpInfo {
    /// Precedence level, higher binds tighter
    pub precedence: u8,
    pub assoc: Associativity,
    pub op: BinOp,
}

#[derive(Debug, Clone)]
pub struct OperatorTable {
    operators: HashMap<&'static str, OpInfo>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorTable {
    pub fn new() -> Self {
        let mut table = Self {
            operators: HashMap::new(),
        };
        table.register_builtins();
        table
    }

    fn register_builtins(&mut self) {
        use Associativity::*;

        // Level 1: ||
        // Level 2: &&
        // Level 3: == != < > <= >= (non-associative)
        // Level 4: ++
        // Level 5: + -
        // Level 6: * / %
        let levels: [(BinOp, u8, Associativity); 14] = [
            (BinOp::Or, 1, Left),
            (BinOp::And, 2, Left),
            (BinOp::Eq, 3, None),
            (BinOp::Neq, 3, None),
            (BinOp::Lt, 3, None),
            (BinOp::Gt, 3, None),
            (BinOp::Lte, 3, None),
            (BinOp::Gte, 3, None),
            (BinOp::Concat, 4, Right),
            (BinOp::Add, 5, Left),
            (BinOp::Sub, 5, Left),
            (BinOp::Mul, 6, Left),
            (BinOp::Div, 6, Left),
            (BinOp::Mod, 6, Left),
        ];
        for (op, precedence, assoc) in levels {
            self.operators.insert(
                op.symbol(),
                OpInfo {
                    precedence,
                    assoc,
                    op,
                },
            );
        }
    }

    pub fn get(&self, op: &str) -> Option<&OpInfo> {
        self.operators.get(op)
    }
}
