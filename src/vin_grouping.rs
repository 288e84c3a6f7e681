/// Vin Grouper
///
/// Partitions a transaction's inputs (and, symmetrically, its outputs) by the
/// address they belong to. Groups come out in order of first appearance and
/// every group keeps its items in transaction order, which the balance folds
/// rely on.

use std::collections::HashMap;

use crate::types::{Vin, Vout};

/// Anything that belongs to exactly one address
pub trait Owned {
    fn owner(&self) -> &str;
}

impl Owned for Vin {
    fn owner(&self) -> &str {
        &self.address_hash
    }
}

impl Owned for Vout {
    fn owner(&self) -> &str {
        &self.address
    }
}

#[derive(Debug, PartialEq)]
pub struct Group<'a, T> {
    pub address: &'a str,
    pub items: Vec<&'a T>,
}

pub fn group_by_owner<T: Owned>(items: &[T]) -> Vec<Group<'_, T>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Group<'_, T>> = Vec::new();

    for item in items {
        let owner = item.owner();
        match index.get(owner) {
            Some(&i) => groups[i].items.push(item),
            None => {
                index.insert(owner, groups.len());
                groups.push(Group {
                    address: owner,
                    items: vec![item],
                });
            }
        }
    }
    groups
}

pub fn group_vins(vins: &[Vin]) -> Vec<Group<'_, Vin>> {
    group_by_owner(vins)
}

pub fn group_vouts(vouts: &[Vout]) -> Vec<Group<'_, Vout>> {
    group_by_owner(vouts)
}
