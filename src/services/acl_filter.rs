//! ACL filter construction.
//!
//! Split in two halves: a pure builder that walks the registry's inheritance
//! graph and produces a predicate tree, and a compiler that lowers the tree
//! into one SQLite statement. Alternative justifications for access (several
//! inheritance chains, several content types) are OR-combined; the links of
//! one chain are AND-combined; a case that does not apply contributes no
//! predicate at all, so it cannot corrupt the reduction.

use std::collections::HashSet;

use crate::models::EntityType;
use crate::permissions::Permission;
use crate::services::permission_registry::{IdCast, PermissionRegistry, Relation};

/// One step along a foreign-key path: the column on the current table and
/// the table it points into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub column: &'static str,
    pub table: &'static str,
}

/// Composable predicate over one entity's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclFilter {
    /// The row itself carries an ACL grant.
    DirectId { entity_key: &'static str },
    /// A row reachable through a monomorphic foreign-key path carries the
    /// grant; the parent's content type is known statically.
    RelatedId {
        prefix: Vec<Hop>,
        column: &'static str,
        parent_key: &'static str,
    },
    /// The grant sits on whatever object a generic (type, id) pair points
    /// at; joined on a synthetic `type || '-' || id` key on both sides.
    GenericKey {
        prefix: Vec<Hop>,
        type_column: &'static str,
        id_column: &'static str,
        cast: Option<IdCast>,
    },
    /// Registered field-query escape hatch.
    FieldQuery {
        entity_key: &'static str,
        table: &'static str,
        field_lookup: &'static str,
        acl_filter: String,
        acl_values: Option<&'static str>,
    },
    And(Vec<AclFilter>),
    Or(Vec<AclFilter>),
}

fn and(mut filters: Vec<AclFilter>) -> AclFilter {
    if filters.len() == 1 {
        filters.remove(0)
    } else {
        AclFilter::And(filters)
    }
}

fn or(mut filters: Vec<AclFilter>) -> AclFilter {
    if filters.len() == 1 {
        filters.remove(0)
    } else {
        AclFilter::Or(filters)
    }
}

/// Build the OR-combined predicate alternatives for one entity.
///
/// Case analysis, in the order the original engine handles it:
/// the entity's own grants, then every registered inheritance chain
/// (recursing through the parents' own rules), then the field-query hatch.
pub fn build_acl_filters(
    registry: &PermissionRegistry,
    entity: &'static EntityType,
) -> Vec<AclFilter> {
    let mut result = vec![AclFilter::DirectId {
        entity_key: entity.key,
    }];

    if let Ok(relations) = registry.get_inheritances(entity) {
        let mut alternatives = Vec::new();
        let mut visited = vec![entity.key];
        for relation in relations {
            let chain = build_relation_filters(registry, *relation, Vec::new(), &mut visited);
            if !chain.is_empty() {
                alternatives.push(and(chain));
            }
        }
        if !alternatives.is_empty() {
            result.push(or(alternatives));
        }
    }

    if let Ok(function) = registry.get_field_query(entity) {
        let query = function();
        result.push(AclFilter::FieldQuery {
            entity_key: entity.key,
            table: entity.table,
            field_lookup: query.field_lookup,
            acl_filter: query.acl_filter,
            acl_values: query.acl_values,
        });
    }

    result
}

/// Predicates for one inheritance link, recursing into the parent's own
/// rules with an extended hop path. The returned list is AND-combined by the
/// caller. Chains stop at generic references (the parent type is unknown
/// statically) and when a parent already appears on the chain (cycle guard).
fn build_relation_filters(
    registry: &PermissionRegistry,
    relation: Relation,
    prefix: Vec<Hop>,
    visited: &mut Vec<&'static str>,
) -> Vec<AclFilter> {
    match relation {
        Relation::Generic {
            type_column,
            id_column,
            cast,
        } => vec![AclFilter::GenericKey {
            prefix,
            type_column,
            id_column,
            cast,
        }],
        Relation::ForeignKey { column, parent } => {
            let mut result = vec![AclFilter::RelatedId {
                prefix: prefix.clone(),
                column,
                parent_key: parent.key,
            }];

            if visited.contains(&parent.key) {
                return result;
            }

            if let Ok(parent_relations) = registry.get_inheritances(parent) {
                visited.push(parent.key);
                let mut alternatives = Vec::new();
                for parent_relation in parent_relations {
                    let mut nested = prefix.clone();
                    nested.push(Hop {
                        column,
                        table: parent.table,
                    });
                    let chain =
                        build_relation_filters(registry, *parent_relation, nested, visited);
                    if !chain.is_empty() {
                        alternatives.push(and(chain));
                    }
                }
                visited.pop();
                if !alternatives.is_empty() {
                    result.push(or(alternatives));
                }
            }

            result
        }
    }
}

/// Parent entity keys referenced by `RelatedId` leaves, for the emptiness
/// probes that drive [`prune_empty`].
pub fn collect_related_parents(filters: &[AclFilter]) -> HashSet<&'static str> {
    let mut parents = HashSet::new();
    for filter in filters {
        collect_into(filter, &mut parents);
    }
    parents
}

fn collect_into(filter: &AclFilter, parents: &mut HashSet<&'static str>) {
    match filter {
        AclFilter::RelatedId { parent_key, .. } => {
            parents.insert(*parent_key);
        }
        AclFilter::And(children) | AclFilter::Or(children) => {
            for child in children {
                collect_into(child, parents);
            }
        }
        _ => {}
    }
}

/// Drop `RelatedId` leaves whose parent holds no matching grant. An empty
/// predicate inside an AND-combined chain would wrongly zero out the whole
/// chain, so it must contribute nothing instead. Combinators left childless
/// are dropped with it.
pub fn prune_empty(filter: AclFilter, empty_parents: &HashSet<&'static str>) -> Option<AclFilter> {
    match filter {
        AclFilter::RelatedId { ref parent_key, .. } => {
            if empty_parents.contains(parent_key) {
                None
            } else {
                Some(filter)
            }
        }
        AclFilter::And(children) => {
            let kept: Vec<_> = children
                .into_iter()
                .filter_map(|child| prune_empty(child, empty_parents))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(and(kept))
            }
        }
        AclFilter::Or(children) => {
            let kept: Vec<_> = children
                .into_iter()
                .filter_map(|child| prune_empty(child, empty_parents))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(or(kept))
            }
        }
        other => Some(other),
    }
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Positional bind value collected while emitting SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Int(i64),
}

/// A complete statement plus its binds, in placeholder order.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

struct Compiler<'a> {
    permission: &'a Permission,
    user_id: i64,
    sql: String,
    binds: Vec<BindValue>,
}

impl<'a> Compiler<'a> {
    /// Subquery projecting the integer object ids of ACL rows granting
    /// `permission` to `user` on objects of `entity_key`.
    fn acl_id_subquery(&mut self, entity_key: &str) {
        self.sql.push_str(
            "SELECT CAST(a.object_id AS INTEGER) FROM access_control_lists a \
             JOIN acl_permissions ap ON ap.acl_id = a.id \
             JOIN stored_permissions sp ON sp.id = ap.permission_id \
             JOIN role_groups rg ON rg.role_id = a.role_id \
             JOIN auth_group_members gm ON gm.group_id = rg.group_id \
             WHERE sp.namespace = ? AND sp.name = ? AND gm.user_id = ? \
             AND a.object_type = ?",
        );
        self.binds.push(BindValue::Text(self.permission.namespace.into()));
        self.binds.push(BindValue::Text(self.permission.name.into()));
        self.binds.push(BindValue::Int(self.user_id));
        self.binds.push(BindValue::Text(entity_key.into()));
    }

    /// Subquery projecting the synthetic `type || '-' || id` keys of all ACL
    /// rows granting `permission` to `user`, regardless of content type.
    fn acl_combo_subquery(&mut self, cast: Option<IdCast>) {
        // The cast normalizes the permissive text storage against typed
        // primary keys before the concatenation.
        let id_expr = match cast {
            Some(IdCast::Integer) => "CAST(a.object_id AS INTEGER)",
            None => "a.object_id",
        };
        self.sql.push_str("SELECT a.object_type || '-' || ");
        self.sql.push_str(id_expr);
        self.sql.push_str(
            " FROM access_control_lists a \
             JOIN acl_permissions ap ON ap.acl_id = a.id \
             JOIN stored_permissions sp ON sp.id = ap.permission_id \
             JOIN role_groups rg ON rg.role_id = a.role_id \
             JOIN auth_group_members gm ON gm.group_id = rg.group_id \
             WHERE sp.namespace = ? AND sp.name = ? AND gm.user_id = ?",
        );
        self.binds.push(BindValue::Text(self.permission.namespace.into()));
        self.binds.push(BindValue::Text(self.permission.name.into()));
        self.binds.push(BindValue::Int(self.user_id));
    }

    /// Emit `alias.col IN (nested hops ... (innermost))` walking the hop
    /// path outside-in; `emit_leaf` writes the deepest subquery body
    /// given the alias of the innermost table.
    fn emit_path<F>(&mut self, prefix: &[Hop], emit_leaf: F)
    where
        F: FnOnce(&mut Self, &str),
    {
        if prefix.is_empty() {
            emit_leaf(self, "t");
            return;
        }

        // t.{h0.column} IN (SELECT p1.id FROM h0.table p1 WHERE <rest>)
        self.sql.push_str(&format!("t.{} IN (", prefix[0].column));
        for (index, hop) in prefix.iter().enumerate() {
            let alias = format!("p{}", index + 1);
            self.sql
                .push_str(&format!("SELECT {a}.id FROM {t} {a} WHERE ", a = alias, t = hop.table));
            if index + 1 < prefix.len() {
                self.sql
                    .push_str(&format!("{}.{} IN (", alias, prefix[index + 1].column));
            }
        }
        let innermost = format!("p{}", prefix.len());
        emit_leaf(self, &innermost);
        for _ in 0..prefix.len() {
            self.sql.push(')');
        }
    }

    fn emit(&mut self, filter: &AclFilter) {
        match filter {
            AclFilter::DirectId { entity_key } => {
                self.sql.push_str("t.id IN (");
                self.acl_id_subquery(entity_key);
                self.sql.push(')');
            }
            AclFilter::RelatedId {
                prefix,
                column,
                parent_key,
            } => {
                self.emit_path(prefix, |this, alias| {
                    this.sql.push_str(&format!("{}.{} IN (", alias, column));
                    this.acl_id_subquery(parent_key);
                    this.sql.push(')');
                });
            }
            AclFilter::GenericKey {
                prefix,
                type_column,
                id_column,
                cast,
            } => {
                let cast = *cast;
                self.emit_path(prefix, |this, alias| {
                    this.sql.push_str(&format!(
                        "({a}.{tc} || '-' || {a}.{ic}) IN (",
                        a = alias,
                        tc = type_column,
                        ic = id_column
                    ));
                    this.acl_combo_subquery(cast);
                    this.sql.push(')');
                });
            }
            AclFilter::FieldQuery {
                entity_key,
                table,
                field_lookup,
                acl_filter,
                acl_values,
            } => {
                let projection = acl_values.unwrap_or("id");
                self.sql
                    .push_str(&format!("t.{} IN (SELECT m.{} FROM {} m WHERE m.id IN (", field_lookup, projection, table));
                self.acl_id_subquery(entity_key);
                self.sql.push_str(&format!(") AND ({}))", acl_filter));
            }
            AclFilter::And(children) => self.emit_group(children, " AND "),
            AclFilter::Or(children) => self.emit_group(children, " OR "),
        }
    }

    fn emit_group(&mut self, children: &[AclFilter], separator: &str) {
        self.sql.push('(');
        for (index, child) in children.iter().enumerate() {
            if index > 0 {
                self.sql.push_str(separator);
            }
            self.emit(child);
        }
        self.sql.push(')');
    }
}

/// Lower pruned filter alternatives into one id-projecting statement over
/// the entity's table.
pub fn compile_restriction(
    entity: &EntityType,
    manager_filter: Option<&str>,
    filters: &[AclFilter],
    permission: &Permission,
    user_id: i64,
) -> CompiledFilter {
    let mut compiler = Compiler {
        permission,
        user_id,
        sql: format!("SELECT t.id FROM {} t WHERE ", entity.table),
        binds: Vec::new(),
    };

    if let Some(manager) = manager_filter {
        compiler.sql.push_str(&format!("({}) AND ", manager));
    }

    compiler.sql.push('(');
    for (index, filter) in filters.iter().enumerate() {
        if index > 0 {
            compiler.sql.push_str(" OR ");
        }
        compiler.emit(filter);
    }
    compiler.sql.push_str(") ORDER BY t.id");

    CompiledFilter {
        sql: compiler.sql,
        binds: compiler.binds,
    }
}

/// EXISTS probe asking whether any ACL row grants `permission` to `user` on
/// objects of `entity_key`; drives the empty-filter pruning.
pub fn compile_grant_probe(permission: &Permission, user_id: i64, entity_key: &str) -> CompiledFilter {
    let mut compiler = Compiler {
        permission,
        user_id,
        sql: String::from("SELECT EXISTS("),
        binds: Vec::new(),
    };
    compiler.acl_id_subquery(entity_key);
    compiler.sql.push(')');
    CompiledFilter {
        sql: compiler.sql,
        binds: compiler.binds,
    }
}
