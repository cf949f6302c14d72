// src/core/constraint.rs

//! Compiles a client-supplied list of `COLUMN OP VALUE` predicates into a
//! filter over the machine catalog.

use crate::core::catalog::model::MachineRow;
use crate::core::errors::QManagerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn parse(token: &str) -> Option<Op> {
        match token {
            "=" => Some(Op::Eq),
            "!=" => Some(Op::Ne),
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Le),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Ge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Domain,
    PrimaryPool,
    Pools,
    Arch,
    Osversion,
    Numcpus,
    Maxjobs,
    Haszfs,
    Online,
}

impl Column {
    fn parse(token: &str) -> Option<Column> {
        match token {
            "name" => Some(Column::Name),
            "domain" => Some(Column::Domain),
            "primarypool" => Some(Column::PrimaryPool),
            "pools" => Some(Column::Pools),
            "arch" => Some(Column::Arch),
            "osversion" => Some(Column::Osversion),
            "numcpus" => Some(Column::Numcpus),
            "maxjobs" => Some(Column::Maxjobs),
            "haszfs" => Some(Column::Haszfs),
            "online" => Some(Column::Online),
            _ => None,
        }
    }

    /// Sequence-valued columns only support equality comparisons; ordering
    /// and substring matching on them is a known gap (see design notes).
    fn is_sequence(self) -> bool {
        matches!(self, Column::Pools)
    }
}

#[derive(Debug, Clone)]
struct Predicate {
    column: Column,
    op: Op,
    value: String,
}

/// A compiled constraint list, ready to test against machine rows.
#[derive(Debug, Clone, Default)]
pub struct CompiledConstraint {
    predicates: Vec<Predicate>,
}

impl CompiledConstraint {
    /// Parses an ordered list of `"COLUMN OP VALUE"` predicate strings.
    pub fn compile(mdl: &[String]) -> Result<Self, QManagerError> {
        let mut predicates = Vec::with_capacity(mdl.len());
        for raw in mdl {
            let mut parts = raw.splitn(3, ' ');
            let (Some(col_tok), Some(op_tok), Some(val_tok)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(QManagerError::ArgumentError(format!(
                    "malformed constraint '{raw}'"
                )));
            };
            let column = Column::parse(col_tok).ok_or_else(|| {
                QManagerError::ArgumentError(format!("unknown column '{col_tok}'"))
            })?;
            let op = Op::parse(op_tok)
                .ok_or_else(|| QManagerError::ArgumentError(format!("unknown operator '{op_tok}'")))?;
            if column.is_sequence() && op != Op::Eq && op != Op::Ne {
                return Err(QManagerError::ArgumentError(format!(
                    "column '{col_tok}' only supports = and !=",
                )));
            }
            predicates.push(Predicate {
                column,
                op,
                value: val_tok.to_string(),
            });
        }
        Ok(Self { predicates })
    }

    /// Evaluates every predicate conjunctively against `machine`.
    pub fn matches(&self, machine: &MachineRow) -> Result<bool, QManagerError> {
        for predicate in &self.predicates {
            if !predicate.eval(machine)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns every machine (in catalog order) satisfying all predicates.
    pub fn select<'a>(
        &self,
        machines: &'a [MachineRow],
    ) -> Result<Vec<&'a MachineRow>, QManagerError> {
        let mut out = Vec::new();
        for m in machines {
            if self.matches(m)? {
                out.push(m);
            }
        }
        Ok(out)
    }
}

impl Predicate {
    fn eval(&self, machine: &MachineRow) -> Result<bool, QManagerError> {
        match self.column {
            Column::Name => cmp_str(&machine.name, self.op, &self.value),
            Column::Domain => cmp_str(&machine.domain, self.op, &self.value),
            Column::PrimaryPool => cmp_str(&machine.primary_pool, self.op, &self.value),
            Column::Arch => cmp_str(&machine.arch, self.op, &self.value),
            Column::Pools => {
                let present = machine.pools.iter().any(|p| p == &self.value);
                Ok(match self.op {
                    Op::Eq => present,
                    Op::Ne => !present,
                    _ => unreachable!("non-equality ops rejected at compile time"),
                })
            }
            Column::Osversion => cmp_int(machine.osversion, self.op, &self.value),
            Column::Numcpus => cmp_int(machine.numcpus, self.op, &self.value),
            Column::Maxjobs => cmp_int(machine.maxjobs, self.op, &self.value),
            Column::Haszfs => cmp_bool(machine.haszfs, self.op, &self.value),
            Column::Online => cmp_bool(machine.online, self.op, &self.value),
        }
    }
}

fn cmp_str(field: &str, op: Op, value: &str) -> Result<bool, QManagerError> {
    Ok(match op {
        Op::Eq => field == value,
        Op::Ne => field != value,
        Op::Lt => field < value,
        Op::Le => field <= value,
        Op::Gt => field > value,
        Op::Ge => field >= value,
    })
}

fn cmp_int(field: i64, op: Op, value: &str) -> Result<bool, QManagerError> {
    let value: i64 = value
        .parse()
        .map_err(|_| QManagerError::ArgumentError(format!("'{value}' is not an integer")))?;
    Ok(match op {
        Op::Eq => field == value,
        Op::Ne => field != value,
        Op::Lt => field < value,
        Op::Le => field <= value,
        Op::Gt => field > value,
        Op::Ge => field >= value,
    })
}

fn cmp_bool(field: bool, op: Op, value: &str) -> Result<bool, QManagerError> {
    let value = match value {
        "1" | "true" => true,
        "0" | "false" => false,
        other => {
            return Err(QManagerError::ArgumentError(format!(
                "'{other}' is not a boolean"
            )));
        }
    };
    Ok(match op {
        Op::Eq => field == value,
        Op::Ne => field != value,
        _ => {
            return Err(QManagerError::ArgumentError(
                "boolean columns only support = and !=".into(),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str, arch: &str, online: bool, maxjobs: i64) -> MachineRow {
        MachineRow {
            id: 1,
            name: name.to_string(),
            domain: "d".to_string(),
            primary_pool: "p1".to_string(),
            pools: vec!["p1".to_string()],
            arch: arch.to_string(),
            osversion: 1200,
            numcpus: 4,
            maxjobs,
            haszfs: true,
            online,
            acl: vec!["open".to_string()],
        }
    }

    #[test]
    fn rejects_unknown_column() {
        let err = CompiledConstraint::compile(&["bogus = 1".to_string()]).unwrap_err();
        assert!(matches!(err, QManagerError::ArgumentError(_)));
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = CompiledConstraint::compile(&["arch ~ amd64".to_string()]).unwrap_err();
        assert!(matches!(err, QManagerError::ArgumentError(_)));
    }

    #[test]
    fn conjunction_across_predicates() {
        let c = CompiledConstraint::compile(&[
            "arch = amd64".to_string(),
            "online = 1".to_string(),
        ])
        .unwrap();
        assert!(c.matches(&machine("m1", "amd64", true, 1)).unwrap());
        assert!(!c.matches(&machine("m1", "amd64", false, 1)).unwrap());
        assert!(!c.matches(&machine("m1", "i386", true, 1)).unwrap());
    }

    #[test]
    fn numeric_ordering_operators() {
        let c = CompiledConstraint::compile(&["maxjobs > 1".to_string()]).unwrap();
        assert!(c.matches(&machine("m1", "amd64", true, 2)).unwrap());
        assert!(!c.matches(&machine("m1", "amd64", true, 1)).unwrap());
    }
}
