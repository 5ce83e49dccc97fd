//! Seed roster import

use rollcall_config::SeedStudent;
use rollcall_store::{Registry, StoreResult};
use tracing::info;

/// Create missing seed students and sync contact/admin flags of existing ones.
///
/// Returns how many students were created.
pub fn seed_students(registry: &dyn Registry, seeds: &[SeedStudent]) -> StoreResult<usize> {
    let mut created = 0;
    for seed in seeds {
        match registry.find_by_display_name(&seed.name)? {
            Some(mut existing) => {
                let contact_id = seed.contact_id.clone().or(existing.contact_id.clone());
                if existing.contact_id != contact_id || existing.is_admin != seed.is_admin {
                    existing.contact_id = contact_id;
                    existing.is_admin = seed.is_admin;
                    registry.update_student(&existing)?;
                    info!(name = %seed.name, admin = seed.is_admin, "Updated seeded student");
                }
            }
            None => {
                registry.create_student(&seed.name, seed.contact_id.as_deref(), seed.is_admin)?;
                created += 1;
            }
        }
    }
    if created > 0 {
        info!(created, "Seeded students from config");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_store::SqliteStore;

    fn seed(name: &str, contact: Option<&str>, admin: bool) -> SeedStudent {
        SeedStudent {
            name: name.into(),
            contact_id: contact.map(str::to_string),
            is_admin: admin,
        }
    }

    #[test]
    fn seeding_is_idempotent_and_updates_flags() {
        let store = SqliteStore::in_memory().unwrap();
        let seeds = vec![seed("김유나", Some("1001"), false), seed("관리자", None, true)];
        assert_eq!(seed_students(&store, &seeds).unwrap(), 2);
        assert_eq!(seed_students(&store, &seeds).unwrap(), 0);

        let promoted = vec![seed("김유나", None, true)];
        seed_students(&store, &promoted).unwrap();
        let record = store.find_by_display_name("김유나").unwrap().unwrap();
        assert!(record.is_admin);
        // A seed without a contact keeps the registered one
        assert_eq!(record.contact_id.as_deref(), Some("1001"));
        assert_eq!(store.list_students().unwrap().len(), 2);
    }
}
