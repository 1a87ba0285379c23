/*!
# MedSim DevKit - Stubs et utilitaires de développement

Bibliothèque facilitant le développement autour du lien série MedSim avec:
- Port série simulé en mémoire (sans carte branchée)
- Injection de pannes (port occupé, injoignable, écriture en échec)
- Harness côté appareil pour piloter et observer un `DeviceLink`
*/

pub mod mock_port;
pub mod test_utils;

pub use mock_port::MockPort;
pub use test_utils::{wait_for_status, DeviceHarness, DeviceMessageBuilder};
